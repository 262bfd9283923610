// Local worker loop (C6): repeatedly pulls one available local test from the
// scheduler and runs it to completion in its snapshot's sub-repo directory.
// N instances of `run_forever` are spawned side by side to get N-way
// concurrency (see driver.rs).

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::ThreadRng;

use crate::process::{build_command, CommandExt};
use crate::scheduler;
use crate::state::Server;
use crate::testmodel::{Test, TestKind, TestResult};

/// Builds the program + args to run a single local test, per §4.6.
fn command_for(test: &Test) -> (&'static str, Vec<String>) {
    match &test.kind {
        TestKind::Lint { .. } => ("grunt", vec!["lint".to_owned()]),
        TestKind::Build { brands, .. } => (
            "grunt",
            vec![format!("--brands={}", brands.join(",")), "--lint=false".to_owned()],
        ),
        TestKind::NpmRun { command, .. } => ("npm", vec!["run".to_owned(), command.clone()]),
        TestKind::Browser(_) | TestKind::Internal => {
            unreachable!("command_for called on a non-local test")
        }
    }
}

/// Runs one local test to completion against `repo_dir`, returning the
/// [`TestResult`] to record. Never returns `Err`: process failures become a
/// failing `TestResult` with a trimmed diagnostic blob.
pub async fn run_local_test(test: &Test, repo_dir: &Path, timeout: Duration) -> TestResult {
    let started = Instant::now();
    let (program, args) = command_for(test);
    let mut cmd = build_command(OsStr::new(program), &args, repo_dir, &[]);
    let outcome = cmd.run_captured(Some(timeout)).await;
    let elapsed = started.elapsed().as_millis() as u64;

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            return TestResult {
                passed: false,
                milliseconds: elapsed,
                message: Some(format!("failed to run {program}: {e:#}")),
            }
        }
    };

    if result.ok() {
        // Full stdout on success; only failures get trimmed down below.
        TestResult {
            passed: true,
            milliseconds: elapsed,
            message: Some(result.stdout_string()),
        }
    } else {
        let message = format!(
            "code: {}\nstdout: {}\nstderr: {}",
            result.code,
            trim_blob(&result.stdout_string()),
            trim_blob(&result.stderr_string()),
        );
        TestResult {
            passed: false,
            milliseconds: elapsed,
            message: Some(message),
        }
    }
}

/// Trims a captured output blob to a sane size for storage/display.
fn trim_blob(s: &str) -> String {
    const LIMIT: usize = 8192;
    if s.len() <= LIMIT {
        s.to_owned()
    } else {
        format!("{}... (truncated)", &s[..LIMIT])
    }
}

/// One iteration: dispatch a local test (if any is available) and run+record
/// it. Returns `true` if a test was dispatched, so the caller can decide
/// whether to sleep before trying again.
async fn step(server: &Server, rng: &mut ThreadRng, timeout: Duration) -> bool {
    let snapshots = server.snapshots();
    let Some((snapshot, test)) = scheduler::dispatch_local(rng, &snapshots) else {
        return false;
    };
    let repo = test
        .kind
        .repo()
        .expect("local tests always carry a repo")
        .to_owned();
    let repo_dir = snapshot.repo_dir(&repo);
    let result = run_local_test(test, &repo_dir, timeout).await;
    // A build test's `success` flag doubles as the build-dependency gate
    // `Snapshot::available_browser` checks; recording the result is enough,
    // no separate bookkeeping needed.
    test.record_local_result(result);
    true
}

/// Runs the worker loop forever: as long as work is available, keep pulling
/// it; otherwise back off for a second. Exceptions while running a test are
/// already folded into a failing [`TestResult`] by `run_local_test`, so the
/// only thing that can reach here is a bug in dispatch bookkeeping, which we
/// report through the server's error field and keep looping past.
pub async fn run_forever(server: Arc<Server>, timeout: Duration) {
    let mut rng = rand::thread_rng();
    loop {
        let dispatched = step(&server, &mut rng, timeout).await;
        if !dispatched {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
