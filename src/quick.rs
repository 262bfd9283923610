// Quick engine (C10): a self-contained loop that runs a fixed battery of
// tests against the live working copy (no snapshotting) and announces
// pass/fail transitions to an external chat channel.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::process::CommandExt;

/// Names of the fixed battery the quick engine runs every cycle.
pub const QUICK_TEST_NAMES: [&str; 5] = ["lint", "typeCheck", "simFuzz", "studioFuzz", "phetioCompare"];

/// Hard character budget for a single chat notification (matches common chat
/// webhook payload limits).
const NOTIFICATION_CHAR_BUDGET: usize = 4000;

/// Wall-clock cap for a single quick-engine cycle; exceeding it aborts the
/// cycle as a failure rather than hanging forever.
pub const CYCLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuickTestEntry {
    pub passed: bool,
    pub message: Option<String>,
    #[serde(rename = "errorMessages")]
    pub error_messages: Vec<String>,
}

/// Served verbatim by `/quickserver/status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestingState {
    pub tests: BTreeMap<String, QuickTestEntry>,
    pub shas: HashMap<String, String>,
    pub timestamp: i64,
}

lazy_static! {
    /// Matches a line that looks like it's introducing a new file in a
    /// lint/type-check report, e.g. `src/foo/Bar.ts` or `/abs/path/Bar.js:12:4`.
    static ref FILE_PATH_LINE: Regex =
        Regex::new(r"^[\w./-]+\.(js|ts|jsx|tsx|mjs)(:\d+(:\d+)?)?\b").unwrap();
}

/// Splits a lint/type-check output blob into per-file error signatures: a new
/// signature starts at each line matching a file-path prefix, and continues
/// until the next file-path line or a blank line.
pub fn extract_signatures(output: &str) -> Vec<String> {
    let mut signatures = Vec::new();
    let mut current: Option<String> = None;
    for line in output.lines() {
        if FILE_PATH_LINE.is_match(line) {
            if let Some(sig) = current.take() {
                signatures.push(sig.trim_end().to_owned());
            }
            current = Some(line.to_owned());
        } else if line.trim().is_empty() {
            if let Some(sig) = current.take() {
                signatures.push(sig.trim_end().to_owned());
            }
        } else if let Some(sig) = current.as_mut() {
            sig.push('\n');
            sig.push_str(line);
        }
    }
    if let Some(sig) = current {
        signatures.push(sig.trim_end().to_owned());
    }
    signatures
}

/// Raw signatures for non-lint/type-check test kinds: the whole blob is one
/// signature (or none, if empty/passing).
pub fn raw_signature(output: &str) -> Vec<String> {
    if output.trim().is_empty() {
        vec![]
    } else {
        vec![output.to_owned()]
    }
}

pub fn signature_hash(signature: &str) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(signature.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Describes what kind of transition occurred between two cycles' failing
/// signature sets for a single test, used to decide whether/what to notify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    FirstCyclePassing,
    PassingToBroken { signatures: Vec<String> },
    BrokenToPassing,
    BrokenWithNewItems { new_signatures: Vec<String> },
    NoChange,
}

/// Compares `previous` against `current` for one test and classifies the
/// transition. `previous == None` means this is the very first cycle.
pub fn classify_transition(
    previous: Option<&QuickTestEntry>,
    current: &QuickTestEntry,
) -> Transition {
    match previous {
        None => {
            if current.passed {
                Transition::FirstCyclePassing
            } else {
                Transition::PassingToBroken {
                    signatures: current.error_messages.clone(),
                }
            }
        }
        Some(prev) => {
            if prev.passed && !current.passed {
                Transition::PassingToBroken {
                    signatures: current.error_messages.clone(),
                }
            } else if !prev.passed && current.passed {
                Transition::BrokenToPassing
            } else if !prev.passed && !current.passed {
                // Compare by hash rather than raw text: two signatures that
                // differ only in incidental whitespace still hash equal to
                // what actually matters for dedup, and the message itself
                // can be arbitrarily large.
                let prev_hashes: BTreeSet<String> =
                    prev.error_messages.iter().map(|s| signature_hash(s)).collect();
                let new_signatures: Vec<String> = current
                    .error_messages
                    .iter()
                    .filter(|s| !prev_hashes.contains(&signature_hash(s)))
                    .cloned()
                    .collect();
                if new_signatures.is_empty() {
                    Transition::NoChange
                } else {
                    Transition::BrokenWithNewItems { new_signatures }
                }
            } else {
                Transition::NoChange
            }
        }
    }
}

/// Renders the chat notification text for a single test's transition, or
/// `None` if the transition isn't notification-worthy.
pub fn notification_text(test_name: &str, transition: &Transition) -> Option<String> {
    let text = match transition {
        Transition::NoChange => return None,
        Transition::FirstCyclePassing => format!("CTQ {test_name} passing"),
        Transition::BrokenToPassing => format!("CTQ {test_name} passing"),
        Transition::PassingToBroken { signatures } => {
            format!("CTQ {test_name} broken:\n{}", signatures.join("\n---\n"))
        }
        Transition::BrokenWithNewItems { new_signatures } => {
            format!(
                "CTQ {test_name} broken with new items:\n{}",
                new_signatures.join("\n---\n")
            )
        }
    };
    Some(truncate_to_budget(&text))
}

fn truncate_to_budget(text: &str) -> String {
    if text.len() <= NOTIFICATION_CHAR_BUDGET {
        text.to_owned()
    } else {
        let mut truncated = text.chars().take(NOTIFICATION_CHAR_BUDGET).collect::<String>();
        truncated.push_str("\n... (truncated)");
        truncated
    }
}

/// Posts a single notification to the configured chat webhook. Swallows and
/// reports its own errors rather than letting a notification failure abort
/// the cycle.
pub async fn post_notification(webhook_url: &str, text: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    client
        .post(webhook_url)
        .json(&serde_json::json!({ "text": text }))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

/// Runs one lint/typeCheck-style command (output scanned for file-path
/// signatures) against `cwd`.
pub async fn run_scanned_test(program: &str, args: &[&str], cwd: &std::path::Path) -> QuickTestEntry {
    run_test_impl(program, args, cwd, true).await
}

/// Runs one test whose output is treated as a single raw signature blob.
pub async fn run_raw_test(program: &str, args: &[&str], cwd: &std::path::Path) -> QuickTestEntry {
    run_test_impl(program, args, cwd, false).await
}

async fn run_test_impl(program: &str, args: &[&str], cwd: &std::path::Path, scan_signatures: bool) -> QuickTestEntry {
    let mut cmd = crate::process::build_command(std::ffi::OsStr::new(program), args, cwd, &[]);
    match cmd.run_captured(Some(CYCLE_TIMEOUT)).await {
        Ok(result) if result.ok() => QuickTestEntry {
            passed: true,
            message: None,
            error_messages: vec![],
        },
        Ok(result) => {
            let blob = format!("{}\n{}", result.stdout_string(), result.stderr_string());
            let error_messages = if scan_signatures {
                extract_signatures(&blob)
            } else {
                raw_signature(&blob)
            };
            QuickTestEntry {
                passed: false,
                message: Some(blob),
                error_messages,
            }
        }
        Err(e) => QuickTestEntry {
            passed: false,
            message: Some(format!("failed to run {program}: {e:#}")),
            error_messages: vec![format!("failed to run {program}")],
        },
    }
}

/// Computes the full set of transitions between two `TestingState`s, ready to
/// be turned into notifications by the caller.
pub fn diff_states(previous: Option<&TestingState>, current: &TestingState) -> Vec<(String, Transition)> {
    current
        .tests
        .iter()
        .map(|(name, entry)| {
            let prev_entry = previous.and_then(|p| p.tests.get(name));
            (name.clone(), classify_transition(prev_entry, entry))
        })
        .collect()
}
