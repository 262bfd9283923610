// Snapshot manager (C3): creates, populates, serializes and removes on-disk
// snapshots, and lets callers enumerate/find the tests inside one.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context};
use log::{debug, info};

use crate::git;
use crate::testmodel::{BrowserTestFields, RawTestDescription, Test, TestKind};

/// An immutable, named, timestamped copy (or pointer, in root-dir mode) of
/// every active repository at specific shas.
pub struct Snapshot {
    pub name: String,
    pub timestamp: i64,
    directory: PathBuf,
    pub use_root_dir: bool,
    exists: AtomicBool,
    pub repos: BTreeSet<String>,
    pub shas: HashMap<String, String>,
    pub tests: Vec<Test>,
    name_index: HashMap<String, usize>,
}

impl Snapshot {
    pub fn exists(&self) -> bool {
        self.exists.load(Ordering::SeqCst)
    }

    /// The directory tests should resolve their URLs/commands relative to:
    /// the repository root in root-dir mode, otherwise this snapshot's own
    /// copy.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn repo_dir(&self, repo: &str) -> PathBuf {
        self.directory.join(repo)
    }

    /// O(1) lookup of a test by its dotted name path. Rebuilt whenever a
    /// snapshot is constructed or deserialized.
    pub fn find_test(&self, names: &[String]) -> Option<&Test> {
        let key = names.join(".");
        self.name_index.get(&key).map(|&i| &self.tests[i])
    }

    pub fn available_local(&self) -> impl Iterator<Item = &Test> {
        self.tests.iter().filter(|t| t.available_local())
    }

    /// A browser test is available iff all of its `build_dependencies` have a
    /// *successful, completed* `build` test in this same snapshot.
    pub fn available_browser(&self) -> impl Iterator<Item = &Test> {
        self.tests.iter().filter(move |t| {
            let TestKind::Browser(BrowserTestFields {
                build_dependencies, ..
            }) = &t.kind
            else {
                return false;
            };
            build_dependencies.iter().all(|dep_repo| {
                self.tests.iter().any(|candidate| {
                    matches!(&candidate.kind, TestKind::Build { repo, .. } if repo == dep_repo)
                        && candidate.complete()
                        && candidate.success()
                })
            })
        })
    }

    /// Flip `exists` to false and, outside root-dir mode, recursively delete
    /// the snapshot's directory. A no-op on the directory in root-dir mode:
    /// such a snapshot never owned its files.
    pub async fn remove(&self) -> anyhow::Result<()> {
        self.exists.store(false, Ordering::SeqCst);
        if self.use_root_dir {
            return Ok(());
        }
        if self.directory.exists() {
            tokio::fs::remove_dir_all(&self.directory)
                .await
                .with_context(|| format!("removing snapshot directory {:?}", self.directory))?;
        }
        Ok(())
    }
}

impl Snapshot {
    /// Reconstructs a snapshot from a persisted checkpoint. `tests` must
    /// already carry their restored mutable state (see `Test::restore_state`).
    /// `exists` reflects whether the directory was confirmed present at
    /// restore time.
    pub fn restore(
        name: String,
        timestamp: i64,
        directory: PathBuf,
        use_root_dir: bool,
        exists: bool,
        repos: BTreeSet<String>,
        shas: HashMap<String, String>,
        tests: Vec<Test>,
    ) -> Self {
        let mut name_index = HashMap::with_capacity(tests.len());
        for (i, t) in tests.iter().enumerate() {
            name_index.insert(t.name_string(), i);
        }
        Self {
            name,
            timestamp,
            directory,
            use_root_dir,
            exists: AtomicBool::new(exists),
            repos,
            shas,
            tests,
            name_index,
        }
    }
}

/// A serializable stub for a snapshot that's pending creation, or awaiting
/// asynchronous deletion (trash). Carries just enough to clean up a directory
/// on restart.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotStub {
    pub name: String,
    pub timestamp: i64,
    pub directory: Option<PathBuf>,
    pub use_root_dir: bool,
}

impl From<&Snapshot> for SnapshotStub {
    fn from(s: &Snapshot) -> Self {
        Self {
            name: s.name.clone(),
            timestamp: s.timestamp,
            directory: if s.use_root_dir {
                None
            } else {
                Some(s.directory.clone())
            },
            use_root_dir: s.use_root_dir,
        }
    }
}

impl SnapshotStub {
    /// Deletes the directory this stub points at, if any. Used to finish off
    /// trashed snapshots (possibly left behind across a restart).
    pub async fn delete_directory(&self) -> anyhow::Result<()> {
        if let Some(dir) = &self.directory {
            if dir.exists() {
                tokio::fs::remove_dir_all(dir)
                    .await
                    .with_context(|| format!("removing trashed snapshot directory {:?}", dir))?;
            }
        }
        Ok(())
    }
}

/// Recursively copies `src` to `dst`, skipping any `node_modules` subtree.
async fn copy_tree_skip_node_modules(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let mut stack = vec![(src.to_owned(), dst.to_owned())];
    while let Some((from, to)) = stack.pop() {
        tokio::fs::create_dir_all(&to)
            .await
            .with_context(|| format!("creating {:?}", to))?;
        let mut entries = tokio::fs::read_dir(&from)
            .await
            .with_context(|| format!("reading {:?}", from))?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name();
            if name == "node_modules" {
                continue;
            }
            let from_child = entry.path();
            let to_child = to.join(&name);
            if file_type.is_dir() {
                stack.push((from_child, to_child));
            } else if file_type.is_symlink() {
                // Preserve symlinks verbatim rather than following them, to
                // avoid accidentally duplicating huge trees pointed at by a
                // symlink loop.
                let target = tokio::fs::read_link(&from_child).await?;
                #[cfg(unix)]
                tokio::fs::symlink(&target, &to_child).await.ok();
            } else {
                tokio::fs::copy(&from_child, &to_child)
                    .await
                    .with_context(|| format!("copying {:?} -> {:?}", from_child, to_child))?;
            }
        }
    }
    Ok(())
}

/// Creates new snapshots and tracks the ones currently live.
pub struct SnapshotManager {
    root: PathBuf,
    snapshots_dir: PathBuf,
    use_root_dir: bool,
}

/// Callback contract the manager needs from outside to build a snapshot: the
/// actual git/process work and the listing helper invocation are supplied by
/// the caller so this module stays testable without real repos.
pub struct CreateSnapshotInputs<'a> {
    pub active_repos: &'a BTreeSet<String>,
    pub active_runnables: &'a BTreeSet<String>,
    pub runnable_deps: &'a HashMap<String, BTreeSet<String>>,
    pub listing_json: &'a str,
}

impl SnapshotManager {
    pub fn new(root: PathBuf, use_root_dir: bool) -> Self {
        Self {
            snapshots_dir: root.join("ct-snapshots"),
            root,
            use_root_dir,
        }
    }

    /// Step 1-6 of §4.3: allocate identity, (maybe) copy repo trees, record
    /// shas, compute per-runnable staleness timestamps, parse the test
    /// listing, and append the synthetic duplicate-check test.
    ///
    /// `now_ms` and `repo_shas`/`repo_timestamps` are supplied by the caller
    /// (driven by `git::head_sha`/`last_commit_timestamp` against the live
    /// working copies) so the construction logic itself has no direct
    /// dependency on wall-clock time or a real git binary, which keeps it
    /// testable.
    pub async fn create(
        &self,
        now_ms: i64,
        repo_shas: &HashMap<String, String>,
        repo_timestamps: &HashMap<String, i64>,
        inputs: CreateSnapshotInputs<'_>,
    ) -> anyhow::Result<Snapshot> {
        let name = format!("snapshot-{now_ms}");
        let directory = if self.use_root_dir {
            self.root.clone()
        } else {
            self.snapshots_dir.join(now_ms.to_string())
        };

        if !self.use_root_dir {
            if let Err(e) = self.populate_directory(&directory, inputs.active_repos).await {
                // Abort: remove whatever we managed to create so it doesn't
                // linger as an orphaned half-snapshot.
                let _ = tokio::fs::remove_dir_all(&directory).await;
                return Err(e).context("creating snapshot directory");
            }
        }

        let shas: HashMap<String, String> = inputs
            .active_repos
            .iter()
            .filter_map(|r| repo_shas.get(r).map(|s| (r.clone(), s.clone())))
            .collect();

        // lastRunnableTimestamp = max(lastRepoTimestamps[d]) over the
        // runnable's transitive dependencies (including itself).
        let mut deps_timestamp: HashMap<String, i64> = HashMap::new();
        for runnable in inputs.active_runnables {
            let mut max_ts = repo_timestamps.get(runnable).copied();
            if let Some(deps) = inputs.runnable_deps.get(runnable) {
                for dep in deps {
                    if let Some(ts) = repo_timestamps.get(dep) {
                        max_ts = Some(max_ts.map_or(*ts, |m| m.max(*ts)));
                    }
                }
            }
            if let Some(ts) = max_ts {
                deps_timestamp.insert(runnable.clone(), ts);
            }
        }

        let raw_tests = match crate::testmodel::parse_listing(inputs.listing_json) {
            Ok(tests) => tests,
            Err(e) => {
                if !self.use_root_dir {
                    let _ = tokio::fs::remove_dir_all(&directory).await;
                }
                return Err(e).context("parsing test listing");
            }
        };

        let mut seen_names = std::collections::HashSet::new();
        let mut had_duplicates = false;
        let mut tests = Vec::with_capacity(raw_tests.len() + 1);
        for raw in raw_tests {
            let name_string = raw.names().join(".");
            if !seen_names.insert(name_string.clone()) {
                had_duplicates = true;
                continue;
            }
            let repo_timestamps = &repo_timestamps;
            let deps_timestamp_ref = &deps_timestamp;
            let test = Test::from_raw(
                raw,
                |repo: &str| repo_timestamps.get(repo).copied(),
                |repo: &str| deps_timestamp_ref.get(repo).copied(),
            )
            .context("building test from listing")?;
            tests.push(test);
        }
        tests.push(Test::internal_duplicate_check(had_duplicates));

        let mut name_index = HashMap::with_capacity(tests.len());
        for (i, t) in tests.iter().enumerate() {
            name_index.insert(t.name_string(), i);
        }

        info!(
            "constructed snapshot {} with {} tests ({} repos)",
            name,
            tests.len(),
            inputs.active_repos.len()
        );

        Ok(Snapshot {
            name,
            timestamp: now_ms,
            directory,
            use_root_dir: self.use_root_dir,
            exists: AtomicBool::new(true),
            repos: inputs.active_repos.clone(),
            shas,
            tests,
            name_index,
        })
    }

    async fn populate_directory(
        &self,
        directory: &Path,
        active_repos: &BTreeSet<String>,
    ) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(directory)
            .await
            .with_context(|| format!("creating {:?}", directory))?;
        for repo in active_repos {
            let src = self.root.join(repo);
            if !src.exists() {
                bail!("active repo {:?} not checked out at {:?}", repo, src);
            }
            let dst = directory.join(repo);
            copy_tree_skip_node_modules(&src, &dst)
                .await
                .with_context(|| format!("copying repo {}", repo))?;
        }
        debug!("populated snapshot directory {:?}", directory);
        Ok(())
    }
}

/// Recomputes `last_sha`-equivalent info for restart: whether snapshot 0
/// (newest) still matches the repos' current HEAD shas.
pub async fn snapshot0_shas_match_current(
    root: &Path,
    snapshot: &Snapshot,
) -> anyhow::Result<bool> {
    for (repo, sha) in &snapshot.shas {
        let current = git::head_sha(root, repo).await?;
        if &current != sha {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use tempfile::TempDir;

    fn listing() -> String {
        serde_json::json!([
            {"type": "lint", "names": ["alpha", "lint"], "repo": "alpha"},
            {"type": "build", "names": ["alpha", "build"], "repo": "alpha", "brands": ["phet"]},
            {
                "type": "sim-test",
                "names": ["alpha", "fuzz", "unbuilt"],
                "repo": "alpha",
                "url": "x/x_en.html",
                "queryParameters": "brand=phet&ea"
            }
        ])
        .to_string()
    }

    async fn make_repo(root: &Path, name: &str) {
        let repo_dir = root.join(name);
        tokio::fs::create_dir_all(&repo_dir).await.unwrap();
        tokio::fs::write(repo_dir.join("package.json"), "{}")
            .await
            .unwrap();
        tokio::fs::create_dir_all(repo_dir.join("node_modules/foo"))
            .await
            .unwrap();
        tokio::fs::write(repo_dir.join("node_modules/foo/x.js"), "x")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_copies_repos_and_skips_node_modules() {
        let tmp = TempDir::new().unwrap();
        make_repo(tmp.path(), "alpha").await;

        let manager = SnapshotManager::new(tmp.path().to_owned(), false);
        let active_repos = BTreeSet::from(["alpha".to_owned()]);
        let shas = Map::from([("alpha".to_owned(), "a".repeat(40))]);
        let timestamps = Map::from([("alpha".to_owned(), 1000_i64)]);
        let listing_json = listing();
        let snapshot = manager
            .create(
                1234,
                &shas,
                &timestamps,
                CreateSnapshotInputs {
                    active_repos: &active_repos,
                    active_runnables: &BTreeSet::new(),
                    runnable_deps: &Map::new(),
                    listing_json: &listing_json,
                },
            )
            .await
            .unwrap();

        assert_eq!(snapshot.name, "snapshot-1234");
        assert!(snapshot.directory().join("alpha/package.json").exists());
        assert!(!snapshot.directory().join("alpha/node_modules").exists());
        // 3 real tests + 1 synthetic duplicate-check test.
        assert_eq!(snapshot.tests.len(), 4);
    }

    #[tokio::test]
    async fn duplicate_names_produce_failing_internal_test() {
        let tmp = TempDir::new().unwrap();
        make_repo(tmp.path(), "alpha").await;
        let manager = SnapshotManager::new(tmp.path().to_owned(), false);
        let active_repos = BTreeSet::from(["alpha".to_owned()]);
        let dup_listing = serde_json::json!([
            {"type": "lint", "names": ["alpha", "lint"], "repo": "alpha"},
            {"type": "lint", "names": ["alpha", "lint"], "repo": "alpha"},
        ])
        .to_string();
        let snapshot = manager
            .create(
                1,
                &Map::new(),
                &Map::new(),
                CreateSnapshotInputs {
                    active_repos: &active_repos,
                    active_runnables: &BTreeSet::new(),
                    runnable_deps: &Map::new(),
                    listing_json: &dup_listing,
                },
            )
            .await
            .unwrap();
        // Only the first "alpha.lint" survives, plus the internal test.
        assert_eq!(snapshot.tests.len(), 2);
        let internal = snapshot
            .find_test(&["internal".to_owned(), "no-duplicate-tests".to_owned()])
            .unwrap();
        assert!(!internal.success());
    }

    #[tokio::test]
    async fn remove_deletes_directory_and_flips_exists() {
        let tmp = TempDir::new().unwrap();
        make_repo(tmp.path(), "alpha").await;
        let manager = SnapshotManager::new(tmp.path().to_owned(), false);
        let active_repos = BTreeSet::from(["alpha".to_owned()]);
        let listing_json = "[]".to_owned();
        let snapshot = manager
            .create(
                1,
                &Map::new(),
                &Map::new(),
                CreateSnapshotInputs {
                    active_repos: &active_repos,
                    active_runnables: &BTreeSet::new(),
                    runnable_deps: &Map::new(),
                    listing_json: &listing_json,
                },
            )
            .await
            .unwrap();
        let dir = snapshot.directory().to_owned();
        assert!(dir.exists());
        snapshot.remove().await.unwrap();
        assert!(!snapshot.exists());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn root_dir_mode_remove_is_a_noop_on_disk() {
        let tmp = TempDir::new().unwrap();
        make_repo(tmp.path(), "alpha").await;
        let manager = SnapshotManager::new(tmp.path().to_owned(), true);
        let active_repos = BTreeSet::from(["alpha".to_owned()]);
        let listing_json = "[]".to_owned();
        let snapshot = manager
            .create(
                1,
                &Map::new(),
                &Map::new(),
                CreateSnapshotInputs {
                    active_repos: &active_repos,
                    active_runnables: &BTreeSet::new(),
                    runnable_deps: &Map::new(),
                    listing_json: &listing_json,
                },
            )
            .await
            .unwrap();
        assert_eq!(snapshot.directory(), tmp.path());
        snapshot.remove().await.unwrap();
        assert!(!snapshot.exists());
        assert!(tmp.path().join("alpha").exists());
    }

    #[tokio::test]
    async fn browser_test_gated_on_build_dependency_success() {
        let tmp = TempDir::new().unwrap();
        make_repo(tmp.path(), "alpha").await;
        let manager = SnapshotManager::new(tmp.path().to_owned(), false);
        let active_repos = BTreeSet::from(["alpha".to_owned()]);
        let listing_json = serde_json::json!([
            {"type": "build", "names": ["alpha", "build"], "repo": "alpha", "brands": ["phet"]},
            {
                "type": "sim-test",
                "names": ["alpha", "sim-fuzz", "built"],
                "repo": "alpha",
                "url": "x/x_en.html",
                "buildDependencies": ["alpha"]
            }
        ])
        .to_string();
        let snapshot = manager
            .create(
                1,
                &Map::new(),
                &Map::new(),
                CreateSnapshotInputs {
                    active_repos: &active_repos,
                    active_runnables: &BTreeSet::new(),
                    runnable_deps: &Map::new(),
                    listing_json: &listing_json,
                },
            )
            .await
            .unwrap();

        assert_eq!(snapshot.available_browser().count(), 0);

        let build_test = snapshot
            .find_test(&["alpha".to_owned(), "build".to_owned()])
            .unwrap();
        build_test.mark_dispatched_local();
        build_test.record_local_result(crate::testmodel::TestResult {
            passed: true,
            milliseconds: 10,
            message: None,
        });

        assert_eq!(snapshot.available_browser().count(), 1);
    }
}
