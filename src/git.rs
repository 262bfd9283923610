// Repo inspector (C2): reads the active-repos/active-runnables/etc lists from
// disk, and answers questions about an individual repo's git state (HEAD sha,
// staleness against origin, last commit timestamp, declared dependencies).
//
// This is deliberately "horribly manual": we shell out to the real `git`
// binary rather than going through a library, because we need behaviour
// (timeouts, `git ls-remote` against an arbitrary origin) that a library
// wouldn't give us any real advantage for.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::Path;
use std::pin::pin;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_stream::try_stream;
use futures::{future::Fuse, select, FutureExt, SinkExt as _, StreamExt as _};
use futures_core::stream::Stream;
use log::debug;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::process::Command;
use tokio::time::sleep;

use crate::process::CommandExt;

/// The server's own repo is never reported stale, to avoid the self-feedback
/// loop of endlessly rebuilding the server because it just rebuilt itself.
pub const SELF_REPO: &str = "aqua";

/// Which newline-delimited list under `perennial/data/` to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepoListKind {
    ActiveRepos,
    ActiveRunnables,
    PhetIo,
    TestablePhetIo,
    TestablePhetIoValidated,
    InteractiveDescriptions,
    NpmUpdate,
}

impl RepoListKind {
    fn filename(self) -> &'static str {
        match self {
            Self::ActiveRepos => "active-repos",
            Self::ActiveRunnables => "active-runnables",
            Self::PhetIo => "phet-io",
            Self::TestablePhetIo => "testable-phet-io",
            Self::TestablePhetIoValidated => "testable-phet-io-validated",
            Self::InteractiveDescriptions => "interactive-descriptions",
            Self::NpmUpdate => "npm-update",
        }
    }
}

/// Read `<root>/perennial/data/<kind>`: one repo name per line, trimming `\r`
/// so the file can be checked out with either line-ending convention.
pub fn list_repos(root: &Path, kind: RepoListKind) -> anyhow::Result<BTreeSet<String>> {
    let path = root.join("perennial/data").join(kind.filename());
    let content =
        std::fs::read_to_string(&path).with_context(|| format!("reading repo list {:?}", path))?;
    Ok(content
        .lines()
        .map(|line| line.trim_end_matches('\r').trim())
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

fn is_hex40(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// `git rev-parse main` in `<root>/<repo>`, validated to be a 40-char hex sha.
pub async fn head_sha(root: &Path, repo: &str) -> anyhow::Result<String> {
    let repo_path = root.join(repo);
    let mut cmd = Command::new("git");
    cmd.args(["rev-parse", "main"]).current_dir(&repo_path);
    let result = cmd
        .run_captured(None)
        .await
        .with_context(|| format!("running git rev-parse in {:?}", repo_path))?;
    if !result.ok() {
        bail!(
            "git rev-parse main failed in {:?}: {}",
            repo_path,
            result.stderr_string()
        );
    }
    let sha = result.stdout_string().trim().to_owned();
    if !is_hex40(&sha) {
        bail!("git rev-parse returned non-sha output {:?}", sha);
    }
    Ok(sha)
}

/// Compares local `HEAD` against the remote's `refs/heads/main` tip. The
/// server's own repo (`aqua`) is hardcoded to never be stale.
pub async fn is_stale(root: &Path, repo: &str, origin_url: &str) -> anyhow::Result<bool> {
    if repo == SELF_REPO {
        return Ok(false);
    }
    let local = head_sha(root, repo).await?;

    let mut cmd = Command::new("git");
    cmd.args(["ls-remote", origin_url, "refs/heads/main"]);
    let result = cmd
        .run_captured(None)
        .await
        .context("running git ls-remote")?;
    if !result.ok() {
        bail!("git ls-remote failed: {}", result.stderr_string());
    }
    let remote_line = result.stdout_string();
    let remote_sha = remote_line
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("empty ls-remote output for {}", repo))?
        .to_owned();
    Ok(local != remote_sha)
}

/// Epoch milliseconds of `HEAD`'s commit.
pub async fn last_commit_timestamp(root: &Path, repo: &str) -> anyhow::Result<i64> {
    let repo_path = root.join(repo);
    let mut cmd = Command::new("git");
    cmd.args(["log", "-1", "--format=%ct"]).current_dir(&repo_path);
    let result = cmd.run_captured(None).await.context("running git log")?;
    if !result.ok() {
        bail!("git log failed in {:?}: {}", repo_path, result.stderr_string());
    }
    let secs: i64 = result
        .stdout_string()
        .trim()
        .parse()
        .context("parsing git log timestamp")?;
    Ok(secs * 1000)
}

/// Runs the external `print-dependencies` helper for `repo` and parses its
/// comma-separated output. A missing/failing helper is treated as "no
/// dependencies" rather than an error, per spec.
pub async fn dependencies_of(root: &Path, repo: &str) -> BTreeSet<String> {
    let repo_path = root.join(repo);
    let mut cmd = Command::new("node");
    cmd.args(["js/print-dependencies.js"]).current_dir(&repo_path);
    let result = match cmd.run_captured(None).await {
        Ok(r) if r.ok() => r,
        Ok(r) => {
            debug!("print-dependencies failed for {}: {}", repo, r.stderr_string());
            return BTreeSet::new();
        }
        Err(e) => {
            debug!("couldn't run print-dependencies for {}: {:#}", repo, e);
            return BTreeSet::new();
        }
    };
    result
        .stdout_string()
        .trim()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// `git pull` in `<root>/<repo>`.
pub async fn pull(root: &Path, repo: &str) -> anyhow::Result<()> {
    let repo_path = root.join(repo);
    let mut cmd = Command::new("git");
    cmd.arg("pull").current_dir(&repo_path);
    let result = cmd
        .run_captured(Some(Duration::from_secs(120)))
        .await
        .with_context(|| format!("running git pull in {:?}", repo_path))?;
    if !result.ok() {
        bail!("git pull failed in {:?}: {}", repo_path, result.stderr_string());
    }
    Ok(())
}

/// `git clone <origin>/<repo>.git` into `<root>/<repo>`, used when a repo
/// listed in active-repos hasn't been checked out locally yet.
pub async fn clone(root: &Path, repo: &str, origin_base: &str) -> anyhow::Result<()> {
    let repo_path = root.join(repo);
    let url = format!("{origin_base}/{repo}.git");
    let mut cmd = Command::new("git");
    cmd.args(["clone", &url]).arg(&repo_path).current_dir(root);
    let result = cmd
        .run_captured(Some(Duration::from_secs(600)))
        .await
        .with_context(|| format!("cloning {} into {:?}", url, repo_path))?;
    if !result.ok() {
        bail!("git clone failed for {}: {}", repo, result.stderr_string());
    }
    Ok(())
}

/// `npm update --cache=<path> --tmp=<path>` in `<root>/<repo>`.
pub async fn npm_update(root: &Path, repo: &str, cache_dir: &Path) -> anyhow::Result<()> {
    let repo_path = root.join(repo);
    let mut cmd = Command::new("npm");
    cmd.arg("update")
        .arg(format!("--cache={}", cache_dir.display()))
        .arg(format!("--tmp={}", cache_dir.display()))
        .current_dir(&repo_path);
    let result = cmd
        .run_captured(Some(Duration::from_secs(300)))
        .await
        .with_context(|| format!("running npm update in {:?}", repo_path))?;
    if !result.ok() {
        bail!("npm update failed in {:?}: {}", repo_path, result.stderr_string());
    }
    Ok(())
}

/// Watches `<root>/<repo>/.git` for changes and yields a debounced "something
/// changed" signal, giving the staleness poller a way to wake up promptly
/// instead of only on a fixed timer. Purely an optimization: the driver loop
/// still re-polls on its own cadence regardless.
///
/// `notify` has no native async support, so we bridge its callback into an
/// unbounded channel and coalesce bursts of events behind a 1s timer.
pub fn watch_repo_changes(
    root: &Path,
    repo: &str,
) -> anyhow::Result<(RecommendedWatcher, impl Stream<Item = ()>)> {
    let git_dir = root.join(repo).join(".git");
    let (mut tx, mut rx) = futures::channel::mpsc::unbounded();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                futures::executor::block_on(async {
                    let _ = tx.send(()).await;
                });
            }
        },
        Config::default(),
    )
    .context("creating filesystem watcher")?;
    watcher
        .watch(&git_dir, RecursiveMode::Recursive)
        .with_context(|| format!("watching {:?}", git_dir))?;

    let stream = try_stream! {
        let mut sleep_fut = pin!(Fuse::terminated());
        loop {
            select! {
                () = sleep_fut => yield (),
                maybe = rx.next() => {
                    match maybe {
                        Some(()) => {
                            if sleep_fut.is_terminated() {
                                sleep_fut.set(sleep(Duration::from_secs(1)).fuse());
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    };
    // try_stream! yields a Result-producing stream even though this
    // particular generator body never actually errors; collapse it down to a
    // plain `Stream<Item = ()>` for callers.
    let stream: Box<dyn Stream<Item = anyhow::Result<()>>> = Box::new(stream);
    let stream = futures::stream::unfold(Box::into_pin(stream), |mut s| async move {
        s.next().await.and_then(|r| r.ok()).map(|()| ((), s))
    });

    Ok((watcher, stream))
}

pub trait OsStrExt {
    fn split_lines(&self) -> Vec<&OsStr>;
}

impl OsStrExt for OsStr {
    fn split_lines(&self) -> Vec<&OsStr> {
        use std::os::unix::ffi::OsStrExt as _;
        let sb = self.as_bytes();
        if sb.is_empty() {
            return vec![];
        }
        let mut start = 0;
        let mut ret = vec![];
        let mut in_line = sb[0] != b'\n';
        for i in 1..sb.len() {
            if in_line {
                if sb[i] == b'\n' {
                    ret.push(OsStr::from_bytes(&sb[start..i]));
                    in_line = false;
                }
            } else if sb[i] != b'\n' {
                start = i;
                in_line = true;
            }
        }
        if in_line {
            ret.push(OsStr::from_bytes(&sb[start..sb.len()]));
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as SyncCommand;
    use tempfile::TempDir;

    fn must_git<I, S>(path: &Path, args: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = SyncCommand::new("git");
        cmd.arg("-C").arg(path).args(args);
        let status = cmd.status().expect("git command failed to spawn");
        assert!(status.success(), "git command failed");
    }

    #[tokio::test]
    async fn head_sha_returns_40_hex_chars() {
        let tmp = TempDir::new().unwrap();
        must_git(tmp.path(), ["init", "-q"]);
        must_git(
            tmp.path(),
            [
                "-c", "user.email=a@b.c", "-c", "user.name=a", "commit", "--allow-empty", "-q",
                "-m", "x",
            ],
        );
        must_git(tmp.path(), ["branch", "-m", "main"]);
        let root = tmp.path().parent().unwrap();
        let repo_name = tmp.path().file_name().unwrap().to_str().unwrap();
        let sha = head_sha(root, repo_name).await.unwrap();
        assert!(is_hex40(&sha), "sha {:?} wasn't 40 hex chars", sha);
    }

    #[test]
    fn self_repo_name_is_aqua() {
        assert_eq!(SELF_REPO, "aqua");
    }

    #[test]
    fn list_repos_trims_cr_and_blank_lines() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("perennial/data")).unwrap();
        std::fs::write(
            tmp.path().join("perennial/data/active-repos"),
            "scenery\r\nsun\n\njoist\r\n",
        )
        .unwrap();
        let repos = list_repos(tmp.path(), RepoListKind::ActiveRepos).unwrap();
        assert_eq!(
            repos,
            BTreeSet::from(["scenery".to_owned(), "sun".to_owned(), "joist".to_owned()])
        );
    }
}
