// Persistence (C8): atomic JSON checkpointing of server state, so a restart
// resumes with the same snapshots/tests instead of starting from empty.
//
// Grounded in the write-to-temp-then-rename pattern used for atomic JSON
// checkpoints in the reference `state_persist.rs` example: never write the
// real state file in place, always build the new content fully in a sibling
// temp file and `rename` it over the old one so a crash mid-write can never
// leave a half-written checkpoint.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::snapshot::{Snapshot, SnapshotStub};
use crate::state::Server;
use crate::testmodel::{Test, TestKind, TestMutableState};

#[derive(Serialize, Deserialize)]
struct PersistedTest {
    names: Vec<String>,
    kind: TestKind,
    priority: f64,
    repo_commit_timestamp: Option<i64>,
    dependencies_commit_timestamp: Option<i64>,
    state: TestMutableState,
}

impl From<&Test> for PersistedTest {
    fn from(t: &Test) -> Self {
        Self {
            names: t.names.clone(),
            kind: t.kind.clone(),
            priority: t.priority,
            repo_commit_timestamp: t.repo_commit_timestamp,
            dependencies_commit_timestamp: t.dependencies_commit_timestamp,
            state: t.state(),
        }
    }
}

impl From<PersistedTest> for Test {
    fn from(p: PersistedTest) -> Self {
        let test = Test::new(
            p.names,
            p.kind,
            p.priority,
            p.repo_commit_timestamp,
            p.dependencies_commit_timestamp,
        );
        test.restore_state(p.state);
        test
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedSnapshot {
    name: String,
    timestamp: i64,
    directory: PathBuf,
    use_root_dir: bool,
    repos: BTreeSet<String>,
    shas: HashMap<String, String>,
    tests: Vec<PersistedTest>,
}

impl From<&Snapshot> for PersistedSnapshot {
    fn from(s: &Snapshot) -> Self {
        Self {
            name: s.name.clone(),
            timestamp: s.timestamp,
            directory: s.directory().to_owned(),
            use_root_dir: s.use_root_dir,
            repos: s.repos.clone(),
            shas: s.shas.clone(),
            tests: s.tests.iter().map(PersistedTest::from).collect(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    snapshots: Vec<PersistedSnapshot>,
    pending: Option<SnapshotStub>,
    trash: Vec<SnapshotStub>,
}

/// Atomically writes `server`'s current state to `path`: serialize to a
/// sibling temp file, then rename over the real path. A reader never
/// observes a partially-written file.
pub async fn save(server: &Server, path: &Path) -> anyhow::Result<()> {
    let state = server.persistable_state();
    let checkpoint = Checkpoint {
        snapshots: state.snapshots.iter().map(|s| PersistedSnapshot::from(s.as_ref())).collect(),
        pending: state.pending,
        trash: state.trash,
    };
    let json = serde_json::to_vec_pretty(&checkpoint).context("serializing checkpoint")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {parent:?}"))?;
    }
    let tmp_path = tmp_path_for(path);
    tokio::fs::write(&tmp_path, &json)
        .await
        .with_context(|| format!("writing {tmp_path:?}"))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("renaming {tmp_path:?} -> {path:?}"))?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_owned();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Loads a checkpoint from `path` if it exists, restoring every snapshot's
/// tests with their full mutable state. Returns `Ok(None)` (not an error) if
/// no checkpoint has ever been written.
pub async fn restore(server: &Server, path: &Path) -> anyhow::Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading checkpoint {path:?}"))?;
    let checkpoint: Checkpoint = serde_json::from_slice(&content).context("parsing checkpoint")?;

    let mut snapshots = Vec::with_capacity(checkpoint.snapshots.len());
    for persisted in checkpoint.snapshots {
        let exists = persisted.use_root_dir || persisted.directory.exists();
        let tests: Vec<Test> = persisted.tests.into_iter().map(Test::from).collect();
        snapshots.push(Snapshot::restore(
            persisted.name,
            persisted.timestamp,
            persisted.directory,
            persisted.use_root_dir,
            exists,
            persisted.repos,
            persisted.shas,
            tests,
        ));
    }

    // Finish off any directories that were mid-deletion when the process
    // last exited.
    for stub in &checkpoint.trash {
        stub.delete_directory().await.ok();
    }

    server.restore_state(snapshots, checkpoint.pending, Vec::new());
    Ok(true)
}

/// Runs the autosave loop: checkpoints every `interval`, forever. Failures
/// are reported through `server`'s error field rather than killing the loop.
pub async fn autosave_forever(server: Arc<Server>, path: PathBuf, interval: std::time::Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if let Err(e) = save(&server, &path).await {
            server.set_error(format!("autosave failed: {e:#}"));
        }
    }
}
