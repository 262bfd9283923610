// Command runner (C1): spawn child processes, capture their full output, and
// never fail just because the child exited non-zero. Callers decide what a
// non-zero exit code means for them.

use std::ffi::OsStr;
use std::os::unix::process::ExitStatusExt as _;
use std::process::{ExitStatus, Output};
use std::time::Duration;

use anyhow::{anyhow, Context};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;

/// The result of running a command to completion (or timeout/kill).
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandResult {
    pub fn ok(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Extension trait for running an async [`Command`] to completion and getting
/// back a [`CommandResult`], with an optional wall-clock timeout.
///
/// Never returns `Err` just because the child exited non-zero: that's
/// reported via `CommandResult::code`. `Err` is reserved for "we couldn't
/// even run the command" (spawn failure) or "the command had to be killed
/// because it overran its timeout".
pub trait CommandExt {
    async fn run_captured(&mut self, timeout_dur: Option<Duration>) -> anyhow::Result<CommandResult>;
}

impl CommandExt for Command {
    async fn run_captured(&mut self, timeout_dur: Option<Duration>) -> anyhow::Result<CommandResult> {
        self.stdout(std::process::Stdio::piped());
        self.stderr(std::process::Stdio::piped());
        let mut child = self.spawn().context("spawning child process")?;

        let Some(dur) = timeout_dur else {
            let output = child
                .wait_with_output()
                .await
                .context("waiting for child process")?;
            return Ok(CommandResult {
                code: output.code_not_killed()?,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        };

        let pid = child.id().map(|id| Pid::from_raw(id as i32));
        tokio::select! {
            output = child.wait_with_output() => {
                let output = output.context("waiting for child process")?;
                Ok(CommandResult {
                    code: output.code_not_killed()?,
                    stdout: output.stdout,
                    stderr: output.stderr,
                })
            }
            _ = tokio::time::sleep(dur) => {
                if let Some(pid) = pid {
                    let _ = kill(pid, Signal::SIGKILL);
                }
                Ok(CommandResult {
                    code: 124,
                    stdout: Vec::new(),
                    stderr: format!("command timed out after {dur:?} and was killed").into_bytes(),
                })
            }
        }
    }
}

/// Extension trait for synchronous [`std::process::Command`], used at
/// `Drop`-time cleanup where we can't hold an executor.
pub trait SyncCommandExt {
    fn execute(&mut self) -> anyhow::Result<Output>;
}

impl SyncCommandExt for std::process::Command {
    fn execute(&mut self) -> anyhow::Result<Output> {
        self.stdout(std::process::Stdio::piped());
        self.stderr(std::process::Stdio::piped());
        let output = self.output().context("spawning child process")?;
        if output.status.code_not_killed()? != 0 {
            return Err(anyhow!(
                "command failed with exit code {}. stderr:\n{}",
                output.status.code_not_killed()?,
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(output)
    }
}

/// Extension trait bridging `ExitStatus`/`Output` to a plain exit code,
/// treating "killed by signal" as an error rather than silently returning 0.
pub trait OutputExt {
    fn code_not_killed(&self) -> anyhow::Result<i32>;
}

impl OutputExt for ExitStatus {
    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.code()
            .ok_or_else(|| anyhow!("process was killed by signal {:?}", self.signal()))
    }
}

impl OutputExt for Output {
    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.status.code_not_killed()
    }
}

/// Build a [`Command`] for `program` with `args`, running in `cwd`, with an
/// optional set of environment variable overrides (e.g. a raised heap size
/// for a grunt invocation).
pub fn build_command<I, S>(
    program: &OsStr,
    args: I,
    cwd: &std::path::Path,
    env: &[(String, String)],
) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.current_dir(cwd);
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd
}
