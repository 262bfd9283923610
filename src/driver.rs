// Driver loops (C11): long-running cooperative tasks supervising the
// snapshot creator, local workers, weight recomputer, report builder,
// autosaver, and quick engine. Each loop catches its own exceptions into the
// server's error field rather than taking the process down.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Timelike;
use log::{info, warn};

use crate::config::ServerConfig;
use crate::git::{self, RepoListKind};
use crate::quick::{self, QuickTestEntry, TestingState};
use crate::report;
use crate::scheduler;
use crate::snapshot::{CreateSnapshotInputs, SnapshotManager};
use crate::state::Server;
use crate::{persistence, worker};

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Runs `node js/list-continuous-tests.js` against the (possibly snapshot)
/// working copy and returns its stdout as the raw listing JSON.
async fn list_continuous_tests(root: &Path) -> anyhow::Result<String> {
    let mut cmd = crate::process::build_command(
        std::ffi::OsStr::new("node"),
        ["js/list-continuous-tests.js"],
        root,
        &[],
    );
    let result = crate::process::CommandExt::run_captured(&mut cmd, Some(Duration::from_secs(120))).await?;
    if !result.ok() {
        anyhow::bail!("list-continuous-tests failed: {}", result.stderr_string());
    }
    Ok(result.stdout_string())
}

/// Pulls/clones/npm-updates every repo currently reported stale (or missing
/// locally). Returns the set of repos it touched.
async fn refresh_stale_repos(
    root: &Path,
    active_repos: &BTreeSet<String>,
    npm_update_repos: &BTreeSet<String>,
    origin_base: &str,
) -> BTreeSet<String> {
    let mut touched = BTreeSet::new();
    for repo in active_repos {
        let repo_path = root.join(repo);
        if !repo_path.exists() {
            if let Err(e) = git::clone(root, repo, origin_base).await {
                warn!("cloning {repo} failed: {e:#}");
            } else {
                touched.insert(repo.clone());
            }
            continue;
        }
        let origin_url = format!("{origin_base}/{repo}.git");
        match git::is_stale(root, repo, &origin_url).await {
            Ok(true) => {
                if let Err(e) = git::pull(root, repo).await {
                    warn!("pulling {repo} failed: {e:#}");
                } else {
                    touched.insert(repo.clone());
                }
            }
            Ok(false) => {}
            Err(e) => warn!("checking staleness of {repo} failed: {e:#}"),
        }
    }
    for repo in npm_update_repos.intersection(&touched).cloned().collect::<Vec<_>>() {
        if let Err(e) = git::npm_update(root, &repo, &root.join(".npm-cache")).await {
            warn!("npm update failed for {repo}: {e:#}");
        }
    }
    touched
}

/// The snapshot creator loop (§4.11). `was_stale` starts `true` so the very
/// first iteration always attempts a snapshot once repos settle.
pub async fn run_snapshot_creator(server: Arc<Server>, config: ServerConfig) {
    if config.no_snapshot {
        server.set_progress("snapshot creation disabled by configuration");
        return;
    }

    let manager = SnapshotManager::new(config.root.clone(), config.use_root_dir);
    let mut was_stale = true;
    let mut root_dir_snapshot_created = false;

    loop {
        if config.use_root_dir {
            if root_dir_snapshot_created {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                continue;
            }
            match create_one_snapshot(&server, &manager, &config).await {
                Ok(()) => {
                    root_dir_snapshot_created = true;
                    server.set_progress("root-dir snapshot created; no further snapshots will be made");
                }
                Err(e) => server.set_error(format!("creating root-dir snapshot failed: {e:#}")),
            }
            continue;
        }

        let active_repos = match git::list_repos(&config.root, RepoListKind::ActiveRepos) {
            Ok(r) => r,
            Err(e) => {
                server.set_error(format!("listing active repos failed: {e:#}"));
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };
        let npm_update_repos = git::list_repos(&config.root, RepoListKind::NpmUpdate).unwrap_or_default();

        if let Some(origin_base) = &config.origin_base {
            let touched = refresh_stale_repos(&config.root, &active_repos, &npm_update_repos, origin_base).await;
            if !touched.is_empty() {
                was_stale = true;
                server.set_progress(format!("refreshed {} stale/missing repos", touched.len()));
                continue;
            }
        }

        if !was_stale {
            tokio::time::sleep(Duration::from_secs(5)).await;
            continue;
        }

        let local_hour = chrono::Local::now().hour() as i64;
        let newest_has_dispatchable_browser_tests = server
            .snapshots()
            .first()
            .map(|s| s.available_browser().any(|t| t.count() == 0))
            .unwrap_or(false);
        if local_hour < 5 && newest_has_dispatchable_browser_tests {
            server.set_progress("deferring snapshot creation: low-traffic hour with dispatchable browser tests remaining");
            tokio::time::sleep(Duration::from_secs(30)).await;
            continue;
        }

        match create_one_snapshot(&server, &manager, &config).await {
            Ok(()) => {
                was_stale = false;
                let retired = server.trash_beyond_third_newest();
                if !retired.is_empty() {
                    spawn_trash_deletion(server.clone(), retired);
                }
                let retired_by_age = server.retire_old_snapshots(now_ms());
                if !retired_by_age.is_empty() {
                    spawn_trash_deletion(server.clone(), retired_by_age);
                }
                if let Err(e) = persistence::save(&server, &config.state_file).await {
                    server.set_error(format!("saving state after snapshot creation failed: {e:#}"));
                }
            }
            Err(e) => server.set_error(format!("creating snapshot failed: {e:#}")),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn create_one_snapshot(server: &Server, manager: &SnapshotManager, config: &ServerConfig) -> anyhow::Result<()> {
    let active_repos = git::list_repos(&config.root, RepoListKind::ActiveRepos)?;
    let active_runnables = git::list_repos(&config.root, RepoListKind::ActiveRunnables)?;

    let mut repo_shas = HashMap::new();
    let mut repo_timestamps = HashMap::new();
    for repo in &active_repos {
        if let Ok(sha) = git::head_sha(&config.root, repo).await {
            repo_shas.insert(repo.clone(), sha);
        }
        if let Ok(ts) = git::last_commit_timestamp(&config.root, repo).await {
            repo_timestamps.insert(repo.clone(), ts);
        }
    }

    let mut runnable_deps = HashMap::new();
    for runnable in &active_runnables {
        runnable_deps.insert(runnable.clone(), git::dependencies_of(&config.root, runnable).await);
    }

    let listing_json = list_continuous_tests(&config.root).await?;

    let snapshot = manager
        .create(
            now_ms(),
            &repo_shas,
            &repo_timestamps,
            CreateSnapshotInputs {
                active_repos: &active_repos,
                active_runnables: &active_runnables,
                runnable_deps: &runnable_deps,
                listing_json: &listing_json,
            },
        )
        .await?;
    info!("created snapshot {}", snapshot.name);
    server.push_snapshot(Arc::new(snapshot));
    Ok(())
}

fn spawn_trash_deletion(server: Arc<Server>, retired: Vec<Arc<crate::snapshot::Snapshot>>) {
    tokio::spawn(async move {
        for snapshot in retired {
            if let Err(e) = snapshot.remove().await {
                server.set_error(format!("deleting trashed snapshot {} failed: {e:#}", snapshot.name));
            } else {
                server.remove_trash_stub(&snapshot.name);
            }
        }
    });
}

pub async fn run_weight_recomputer(server: Arc<Server>) {
    loop {
        let snapshots = server.snapshots();
        scheduler::recompute_all_weights(now_ms(), &snapshots);
        tokio::time::sleep(Duration::from_secs(30)).await;
    }
}

pub async fn run_report_builder(server: Arc<Server>) {
    loop {
        if let Err(e) = report::refresh_report_cache(&server) {
            server.set_error(format!("building report failed: {e:#}"));
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

pub fn spawn_local_workers(server: Arc<Server>, count: usize, timeout: Duration) -> Vec<tokio::task::JoinHandle<()>> {
    (0..count)
        .map(|_| {
            let server = server.clone();
            tokio::spawn(worker::run_forever(server, timeout))
        })
        .collect()
}

/// One quick-engine cycle: runs the fixed battery against the live working
/// copy, diffs against the previous `TestingState`, and posts any
/// notification-worthy transitions.
async fn run_quick_cycle(server: &Server, config: &ServerConfig) {
    let root = &config.root;
    let active_repos = git::list_repos(root, RepoListKind::ActiveRepos).unwrap_or_default();

    if let Some(origin_base) = &config.origin_base {
        refresh_stale_repos(root, &active_repos, &BTreeSet::new(), origin_base).await;
    }

    let mut tests = std::collections::BTreeMap::new();
    tests.insert("lint".to_owned(), quick::run_scanned_test("grunt", &["lint"], root).await);
    tests.insert(
        "typeCheck".to_owned(),
        quick::run_scanned_test("grunt", &["type-check"], root).await,
    );
    tests.insert(
        "simFuzz".to_owned(),
        quick::run_raw_test("node", &["js/run-sim-fuzz.js"], root).await,
    );
    tests.insert(
        "studioFuzz".to_owned(),
        quick::run_raw_test("node", &["js/run-studio-fuzz.js"], root).await,
    );
    tests.insert(
        "phetioCompare".to_owned(),
        quick::run_raw_test("node", &["js/run-phetio-compare.js"], root).await,
    );

    let mut shas = HashMap::new();
    for repo in &active_repos {
        if let Ok(sha) = git::head_sha(root, repo).await {
            shas.insert(repo.clone(), sha);
        }
    }

    let current = TestingState {
        tests,
        shas,
        timestamp: now_ms(),
    };

    let previous = server.testing_state();
    let previous = if previous.timestamp == 0 && previous.tests.is_empty() {
        None
    } else {
        Some(previous.as_ref())
    };
    let transitions = quick::diff_states(previous, &current);

    if let Some(webhook_url) = &config.webhook_url {
        for (name, transition) in &transitions {
            if let Some(text) = quick::notification_text(name, transition) {
                if let Err(e) = quick::post_notification(webhook_url, &text).await {
                    warn!("posting quick-engine notification for {name} failed: {e:#}");
                }
            }
        }
    }

    server.set_testing_state(current);
}

pub async fn run_quick_engine(server: Arc<Server>, config: ServerConfig) {
    loop {
        let cycle = run_quick_cycle(&server, &config);
        match tokio::time::timeout(quick::CYCLE_TIMEOUT, cycle).await {
            Ok(()) => {}
            Err(_) => server.set_error("quick engine cycle exceeded its wall-clock cap"),
        }
        tokio::time::sleep(Duration::from_secs(config.quick_cycle_end_wait_secs)).await;
    }
}

/// Restores persisted state (if any), then spawns every driver loop. Returns
/// the join handles so `main` can hold them open for the process lifetime.
pub async fn start(server: Arc<Server>, config: ServerConfig) -> anyhow::Result<Vec<tokio::task::JoinHandle<()>>> {
    if !config.use_root_dir {
        match persistence::restore(&server, &config.state_file).await {
            Ok(true) => info!("restored state from {:?}", config.state_file),
            Ok(false) => info!("no existing checkpoint at {:?}; starting fresh", config.state_file),
            Err(e) => warn!("failed to restore checkpoint {:?}: {e:#}", config.state_file),
        }
    }
    server.set_progress("running");

    let mut handles = Vec::new();
    handles.push(tokio::spawn(run_snapshot_creator(server.clone(), config.clone())));
    handles.push(tokio::spawn(run_weight_recomputer(server.clone())));
    handles.push(tokio::spawn(run_report_builder(server.clone())));
    handles.extend(spawn_local_workers(
        server.clone(),
        config.local_count,
        Duration::from_secs(config.local_test_timeout_secs),
    ));
    if !config.use_root_dir {
        let server = server.clone();
        let state_file = config.state_file.clone();
        handles.push(tokio::spawn(persistence::autosave_forever(
            server,
            state_file,
            Duration::from_secs(5 * 60),
        )));
    }
    handles.push(tokio::spawn(run_quick_engine(server.clone(), config.clone())));
    Ok(handles)
}
