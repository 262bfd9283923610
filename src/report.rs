// Result intake & report (C7): turns a browser client's `/test-result` POST
// into a recorded `TestResult`, and periodically builds the aggregate JSON
// report served at `/report`.

use std::collections::BTreeSet;
use std::sync::Arc;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::state::Server;
use crate::testmodel::TestResult;

/// Wire shape of an incoming `/aquaserver/test-result` POST.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingResult {
    #[serde(rename = "snapshotName")]
    pub snapshot_name: String,
    pub test: Vec<String>,
    pub passed: bool,
    pub message: Option<String>,
    /// Epoch ms the browser client recorded as the test's start time; used to
    /// compute elapsed time. Defaults to "now" if absent.
    pub timestamp: Option<i64>,
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
}

/// Records one browser-test result against the matching snapshot/test, or
/// silently drops it if either can't be found, or if it's a stale
/// "errors.html#timeout" report (the client's own watchdog firing after the
/// server already moved on). Returns `true` if the result was recorded.
pub fn record_result(server: &Server, now_ms: i64, incoming: IncomingResult) -> bool {
    if let Some(message) = &incoming.message {
        if message.contains("errors.html#timeout") {
            return false;
        }
    }
    let Some(snapshot) = server.find_snapshot(&incoming.snapshot_name) else {
        return false;
    };
    let Some(test) = snapshot.find_test(&incoming.test) else {
        return false;
    };
    let elapsed = incoming
        .timestamp
        .map(|ts| (now_ms - ts).max(0) as u64)
        .unwrap_or(0);
    let message = match (incoming.passed, incoming.message) {
        (false, None) => incoming
            .client_id
            .map(|id| format!("failed with no message (client {id})")),
        (_, m) => m,
    };
    test.record_browser_result(TestResult {
        passed: incoming.passed,
        milliseconds: elapsed,
        message,
    });
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    /// Count of recorded passing results for this (snapshot, test).
    pub y: usize,
    /// Count of recorded failing results for this (snapshot, test).
    pub n: usize,
    /// Deduplicated, non-empty failure messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    #[serde(rename = "snapshotNames")]
    pub snapshot_names: Vec<String>,
    #[serde(rename = "testNames")]
    pub test_names: Vec<Vec<String>>,
    /// `results[testIndex][snapshotIndex]`, omitted where the test doesn't
    /// exist in that snapshot.
    pub results: Vec<Vec<Option<ReportEntry>>>,
    #[serde(rename = "testAverageTimes")]
    pub test_average_times: Vec<f64>,
    #[serde(rename = "testWeights")]
    pub test_weights: Vec<f64>,
}

/// Builds the full report over (at most) the 100 newest snapshots, per §4.7.
pub fn build_report(snapshots: &[Arc<crate::snapshot::Snapshot>]) -> Report {
    let considered: Vec<_> = snapshots.iter().take(100).collect();
    let snapshot_names: Vec<String> = considered.iter().map(|s| s.name.clone()).collect();

    let mut test_names: BTreeSet<Vec<String>> = BTreeSet::new();
    for snapshot in &considered {
        for test in &snapshot.tests {
            test_names.insert(test.names.clone());
        }
    }
    let test_names: Vec<Vec<String>> = test_names.into_iter().collect();

    let mut results = Vec::with_capacity(test_names.len());
    let mut test_average_times = Vec::with_capacity(test_names.len());
    let mut test_weights = Vec::with_capacity(test_names.len());

    for names in &test_names {
        let mut row = Vec::with_capacity(considered.len());
        let mut total_ms = 0u64;
        let mut sample_count = 0u64;
        let mut weight = 0.0;
        for snapshot in &considered {
            let Some(test) = snapshot.find_test(names) else {
                row.push(None);
                continue;
            };
            let state = test.state();
            weight = test.weight();
            if state.results.is_empty() {
                row.push(None);
                continue;
            }
            let mut y = 0usize;
            let mut n = 0usize;
            for result in &state.results {
                if result.milliseconds != 0 {
                    total_ms += result.milliseconds;
                    sample_count += 1;
                }
                if result.passed {
                    y += 1;
                } else {
                    n += 1;
                }
            }
            let messages: Vec<String> = state
                .results
                .iter()
                .filter(|r| !r.passed)
                .filter_map(|r| r.message.clone())
                .filter(|m| !m.is_empty())
                .unique()
                .collect();
            row.push(Some(ReportEntry {
                y,
                n,
                m: if messages.is_empty() { None } else { Some(messages) },
            }));
        }
        results.push(row);
        test_average_times.push(if sample_count > 0 {
            total_ms as f64 / sample_count as f64
        } else {
            0.0
        });
        // Round to 1/100 per §4.7's stated precision for the wire report.
        test_weights.push((weight * 100.0).round() / 100.0);
    }

    Report {
        snapshot_names,
        test_names,
        results,
        test_average_times,
        test_weights,
    }
}

/// Recomputes and caches the report JSON on `server`. Run on the 5s cadence
/// described in §4.7/§5.
pub fn refresh_report_cache(server: &Server) -> anyhow::Result<()> {
    let snapshots = server.snapshots();
    let report = build_report(&snapshots);
    let json = serde_json::to_string(&report)?;
    server.set_report_json(Arc::from(json));
    Ok(())
}
