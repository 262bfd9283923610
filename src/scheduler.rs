// Scheduler (C5): decides which test to hand to a local worker or to a
// requesting browser, balancing fairness (lowest-count-first) against a
// weighted bias toward higher-priority, staler, more-often-failing tests.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use crate::snapshot::Snapshot;
use crate::testmodel::{Dispatch, Test};

const HOUR_MS: f64 = 3_600_000.0;

/// Linear interpolation between `(x0, y0)` and `(x1, y1)`.
fn lerp(x: f64, x0: f64, y0: f64, x1: f64, y1: f64) -> f64 {
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Piecewise-linear age factor for `repoCommitTimestamp`: 2.0 at age 0, 1.0
/// at 2h, 0.5 at 12h, constant 0.5 beyond.
pub fn repo_age_factor(age_ms: i64) -> f64 {
    let age_h = age_ms.max(0) as f64 / HOUR_MS;
    if age_h <= 2.0 {
        lerp(age_h, 0.0, 2.0, 2.0, 1.0)
    } else if age_h <= 12.0 {
        lerp(age_h, 2.0, 1.0, 12.0, 0.5)
    } else {
        0.5
    }
}

/// Piecewise-linear age factor for `dependenciesCommitTimestamp`: 1.5 at age
/// 0, 1.0 at 2h, 0.75 at 12h, constant 0.75 beyond.
pub fn deps_age_factor(age_ms: i64) -> f64 {
    let age_h = age_ms.max(0) as f64 / HOUR_MS;
    if age_h <= 2.0 {
        lerp(age_h, 0.0, 1.5, 2.0, 1.0)
    } else if age_h <= 12.0 {
        lerp(age_h, 2.0, 1.0, 12.0, 0.75)
    } else {
        0.75
    }
}

/// Computes the weight of the newest test in `history` (a newest-first list
/// of the same-`nameString` test across retained snapshots, with the test
/// being scored as the first element).
pub fn compute_weight(now_ms: i64, history: &[&Test]) -> f64 {
    let Some(test) = history.first() else {
        return 0.0;
    };
    let mut weight = test.priority;
    if let Some(ts) = test.repo_commit_timestamp {
        weight *= repo_age_factor(now_ms - ts);
    }
    if let Some(ts) = test.dependencies_commit_timestamp {
        weight *= deps_age_factor(now_ms - ts);
    }

    let last_failed_index = history.iter().position(|t| t.results().iter().any(|r| !r.passed));
    match last_failed_index {
        Some(idx) => weight *= if idx < 3 { 6.0 } else { 3.0 },
        None => {
            let last_tested_index = history.iter().position(|t| !t.results().is_empty());
            weight *= match last_tested_index {
                None => 1.5,
                Some(0) => 0.3,
                Some(1) => 0.7,
                Some(_) => 1.0,
            };
        }
    }
    weight.max(0.0)
}

/// Recomputes and stores `weight` on every test across every retained
/// snapshot. Run on a 30s cadence and immediately before each dispatch.
pub fn recompute_all_weights(now_ms: i64, snapshots: &[Arc<Snapshot>]) {
    // Group tests by nameString, newest-first (snapshots is already kept
    // newest-first by the caller).
    let mut by_name: HashMap<String, Vec<&Test>> = HashMap::new();
    for snapshot in snapshots {
        for test in &snapshot.tests {
            by_name.entry(test.name_string()).or_default().push(test);
        }
    }
    for history in by_name.values() {
        let weight = compute_weight(now_ms, history);
        // Every same-nameString occurrence across retained snapshots shares
        // the one computed weight: `local_candidates`/`browser_candidates`
        // draw from the two newest snapshots, so the second-newest's copy of
        // a test must carry its true weight too, not just the newest's.
        for test in history {
            test.set_weight(weight);
        }
    }
}

/// Draws one item from `candidates` with probability proportional to
/// `weight_fn`. Ties/zero-weight pools fall back to the last candidate.
pub fn sample_weighted<'a, T>(
    rng: &mut impl Rng,
    candidates: &'a [T],
    weight_fn: impl Fn(&T) -> f64,
) -> Option<&'a T> {
    if candidates.is_empty() {
        return None;
    }
    let total: f64 = candidates.iter().map(&weight_fn).sum();
    if total <= 0.0 {
        return candidates.last();
    }
    let r: f64 = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    for candidate in candidates {
        cumulative += weight_fn(candidate);
        if cumulative >= r {
            return Some(candidate);
        }
    }
    candidates.last()
}

pub struct LocalCandidate<'s> {
    pub snapshot: &'s Arc<Snapshot>,
    pub test: &'s Test,
}

pub struct BrowserCandidate<'s> {
    pub snapshot: &'s Arc<Snapshot>,
    pub test: &'s Test,
}

/// Pool of local candidates: available tests in the two newest snapshots.
pub fn local_candidates(snapshots: &[Arc<Snapshot>]) -> Vec<LocalCandidate<'_>> {
    snapshots
        .iter()
        .take(2)
        .flat_map(|s| s.available_local().map(move |t| LocalCandidate { snapshot: s, test: t }))
        .collect()
}

/// Pool of browser candidates: available tests in the two newest snapshots,
/// filtered down to those sharing the minimum observed dispatch count.
pub fn browser_candidates(snapshots: &[Arc<Snapshot>]) -> Vec<BrowserCandidate<'_>> {
    let all: Vec<_> = snapshots
        .iter()
        .take(2)
        .flat_map(|s| s.available_browser().map(move |t| BrowserCandidate { snapshot: s, test: t }))
        .collect();
    let Some(min_count) = all.iter().map(|c| c.test.count()).min() else {
        return vec![];
    };
    all.into_iter().filter(|c| c.test.count() == min_count).collect()
}

/// Picks a local test to dispatch and marks it `complete` *before* returning,
/// so a subsequent `available_local()` call never offers it again even if the
/// caller hasn't run the command yet.
pub fn dispatch_local<'s>(
    rng: &mut impl Rng,
    snapshots: &'s [Arc<Snapshot>],
) -> Option<(Arc<Snapshot>, &'s Test)> {
    let candidates = local_candidates(snapshots);
    let picked = sample_weighted(rng, &candidates, |c| c.test.weight().max(0.0001))?;
    picked.test.mark_dispatched_local();
    Some((picked.snapshot.clone(), picked.test))
}

/// Picks a browser test to dispatch, increments its count, and builds the
/// wire dispatch object. Returns the empty dispatch if no test is available.
pub fn dispatch_browser(rng: &mut impl Rng, snapshots: &[Arc<Snapshot>], now_ms: i64) -> Dispatch {
    let candidates = browser_candidates(snapshots);
    let Some(picked) = sample_weighted(rng, &candidates, |c| c.test.weight().max(0.0001)) else {
        return Dispatch::empty();
    };
    picked.test.dispatch_browser();
    let base_url = if picked.snapshot.use_root_dir {
        picked.snapshot.directory().display().to_string()
    } else {
        picked.snapshot.name.clone()
    };
    let url = match picked.test.browser_url(&base_url) {
        Ok(u) => u,
        Err(_) => return Dispatch::empty(),
    };
    Dispatch {
        snapshot_name: Some(picked.snapshot.name.clone()),
        test: Some(picked.test.names.clone()),
        url,
        timestamp: now_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 2.0; "age zero")]
    #[test_case(2 * 3_600_000, 1.0; "age two hours")]
    #[test_case(12 * 3_600_000, 0.5; "age twelve hours")]
    #[test_case(24 * 3_600_000, 0.5; "age beyond twelve hours stays constant")]
    fn repo_age_factor_boundaries(age_ms: i64, want: f64) {
        assert!((repo_age_factor(age_ms) - want).abs() < 1e-9);
    }

    #[test_case(0, 1.5; "age zero")]
    #[test_case(2 * 3_600_000, 1.0; "age two hours")]
    #[test_case(12 * 3_600_000, 0.75; "age twelve hours")]
    #[test_case(24 * 3_600_000, 0.75; "age beyond twelve hours stays constant")]
    fn deps_age_factor_boundaries(age_ms: i64, want: f64) {
        assert!((deps_age_factor(age_ms) - want).abs() < 1e-9);
    }

    fn make_test(repo_ts: Option<i64>) -> Test {
        Test::new(
            vec!["alpha".into(), "lint".into()],
            crate::testmodel::TestKind::Lint { repo: "alpha".into() },
            1.0,
            repo_ts,
            None,
        )
    }

    #[test]
    fn never_tested_gets_1_5x_multiplier() {
        let t = make_test(None);
        let weight = compute_weight(0, &[&t]);
        assert!((weight - 1.5).abs() < 1e-9);
    }

    #[test]
    fn tested_in_newest_snapshot_gets_0_3x_multiplier() {
        let newest = make_test(None);
        newest.mark_dispatched_local();
        newest.record_local_result(crate::testmodel::TestResult {
            passed: true,
            milliseconds: 1,
            message: None,
        });
        let older = make_test(None);
        let weight = compute_weight(0, &[&newest, &older]);
        assert!((weight - 0.3).abs() < 1e-9);
    }

    #[test]
    fn any_failure_in_top_three_gets_6x_multiplier() {
        let newest = make_test(None);
        newest.mark_dispatched_local();
        newest.record_local_result(crate::testmodel::TestResult {
            passed: false,
            milliseconds: 1,
            message: Some("boom".into()),
        });
        let weight = compute_weight(0, &[&newest]);
        assert!((weight - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn recompute_all_weights_updates_second_newest_snapshots_copy_too() {
        use crate::snapshot::{CreateSnapshotInputs, SnapshotManager};
        use std::collections::{BTreeSet, HashMap};
        use std::sync::Arc as StdArc;
        use tempfile::TempDir;

        let tmp = TempDir::new().unwrap();
        tokio::fs::create_dir_all(tmp.path().join("alpha")).await.unwrap();
        let manager = SnapshotManager::new(tmp.path().to_owned(), false);
        let active_repos = BTreeSet::from(["alpha".to_owned()]);
        let listing = serde_json::json!([
            {"type": "lint", "names": ["alpha", "lint"], "repo": "alpha"}
        ])
        .to_string();
        let make_inputs = || CreateSnapshotInputs {
            active_repos: &active_repos,
            active_runnables: &BTreeSet::new(),
            runnable_deps: &HashMap::new(),
            listing_json: &listing,
        };

        // Two snapshots, each with their own copy of the same-nameString test.
        let newer = manager.create(2, &HashMap::new(), &HashMap::new(), make_inputs()).await.unwrap();
        let older = manager.create(1, &HashMap::new(), &HashMap::new(), make_inputs()).await.unwrap();
        let snapshots = vec![StdArc::new(newer), StdArc::new(older)];

        recompute_all_weights(0, &snapshots);

        let newer_test = snapshots[0].find_test(&["alpha".to_owned(), "lint".to_owned()]).unwrap();
        let older_test = snapshots[1].find_test(&["alpha".to_owned(), "lint".to_owned()]).unwrap();
        assert!(newer_test.weight() > 0.0);
        assert_eq!(newer_test.weight(), older_test.weight());
    }

    #[test]
    fn weighted_dispatch_ratio_matches_theoretical_distribution() {
        // T1: priority 1, "tested in snapshot 0" (0.3x). T2: priority 1,
        // never tested (1.5x). Ratio should land near 1:5 over many draws.
        let t1 = make_test(None);
        t1.mark_dispatched_local();
        t1.record_local_result(crate::testmodel::TestResult {
            passed: true,
            milliseconds: 1,
            message: None,
        });
        t1.set_weight(compute_weight(0, &[&t1]));
        let t2 = make_test(None);
        t2.set_weight(compute_weight(0, &[&t2]));

        let candidates = vec![&t1, &t2];
        let mut rng = rand::thread_rng();
        let mut t1_count = 0usize;
        let mut t2_count = 0usize;
        for _ in 0..10_000 {
            let picked = sample_weighted(&mut rng, &candidates, |t| t.weight()).unwrap();
            if std::ptr::eq(*picked, &t1) {
                t1_count += 1;
            } else {
                t2_count += 1;
            }
        }
        let ratio = t2_count as f64 / t1_count as f64;
        assert!((ratio - 5.0).abs() < 0.5, "ratio was {ratio}, expected ~5.0");
    }
}
