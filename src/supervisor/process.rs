//! OS child processes: termination and the single-module subprocess variant.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};

use super::framework::RunningService;
use super::module_loader::Artifact;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },
    #[error("process {pid} has already exited")]
    AlreadyExited { pid: u32 },
    #[error("failed to terminate process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },
}

/// Sends SIGTERM (Unix) so the process can shut down cleanly.
#[cfg(unix)]
pub fn send_terminate(pid: u32) -> Result<(), ProcessError> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(ProcessError::AlreadyExited { pid }),
        Err(e) => Err(ProcessError::TerminationFailed {
            pid,
            reason: format!("Failed to send signal: {}", e),
        }),
    }
}

/// Shell-style exit code: signal terminations map to `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// A spawned child process seen as a [`RunningService`].
///
/// `stop` sends SIGTERM; when `kill_after` is set, a child still alive that
/// long after the stop request is killed.
pub struct ChildService {
    label: String,
    child: Child,
    kill_after: Option<Duration>,
    stop_requested: bool,
}

impl ChildService {
    pub fn new(label: impl Into<String>, child: Child, kill_after: Option<Duration>) -> Self {
        Self {
            label: label.into(),
            child,
            kill_after,
            stop_requested: false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

#[async_trait]
impl RunningService for ChildService {
    async fn wait(&mut self) -> Result<i32> {
        let status = match (self.stop_requested, self.kill_after) {
            (true, Some(grace)) => match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    tracing::warn!(
                        "'{}' still running {:?} after termination request, killing",
                        self.label,
                        grace
                    );
                    self.child.start_kill()?;
                    self.child.wait().await?
                }
            },
            _ => self.child.wait().await?,
        };
        Ok(exit_code(status))
    }

    async fn stop(&mut self) -> Result<()> {
        self.stop_requested = true;
        let Some(pid) = self.child.id() else {
            // already reaped
            return Ok(());
        };
        tracing::info!("Sending TERM to '{}' (pid: {})", self.label, pid);

        match request_exit(pid) {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.child.start_kill()?;
                Ok(())
            }
            Err(e) => {
                self.child.start_kill()?;
                Err(e.into())
            }
        }
    }
}

/// Asks `pid` to exit. `Ok(false)` where the platform has no graceful signal.
#[cfg(unix)]
fn request_exit(pid: u32) -> Result<bool, ProcessError> {
    match send_terminate(pid) {
        Ok(()) | Err(ProcessError::AlreadyExited { .. }) => Ok(true),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn request_exit(_pid: u32) -> Result<bool, ProcessError> {
    Ok(false)
}

/// External command used to run one module in its own OS process.
///
/// `{artifact}` and `{module}` in arguments and environment values are replaced
/// by the artifact's path and the module name. The child inherits the
/// launcher's stdin, stdout and stderr.
#[derive(Debug, Clone)]
pub struct SubprocessCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub kill_after: Option<Duration>,
}

impl SubprocessCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            kill_after: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn kill_after(mut self, grace: Option<Duration>) -> Self {
        self.kill_after = grace;
        self
    }

    fn expand(value: &str, artifact: &Artifact) -> String {
        value
            .replace("{artifact}", &artifact.path.to_string_lossy())
            .replace("{module}", artifact.module.stem())
    }

    /// Spawns the command for `artifact`.
    pub fn spawn(&self, artifact: &Artifact) -> Result<ChildService> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(|a| Self::expand(a, artifact)))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, Self::expand(value, artifact));
        }

        let child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            program: self.program.display().to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(
            "Module '{}' running as pid {}",
            artifact.module,
            child.id().unwrap_or_default()
        );
        Ok(ChildService::new(artifact.module.to_string(), child, self.kill_after))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::supervisor::module_loader::{self, tests::write_module, tests::ECHO_MANIFEST};

    fn artifact() -> (tempfile::TempDir, Artifact) {
        let home = tempfile::tempdir().unwrap();
        write_module(home.path(), "echo.zip", &[("module.toml", ECHO_MANIFEST)]);
        let artifact = module_loader::resolve(home.path(), "echo").unwrap();
        (home, artifact)
    }

    #[tokio::test]
    async fn placeholders_are_expanded() {
        let (_home, artifact) = artifact();
        let command = SubprocessCommand::new("sh")
            .arg("-c")
            .arg("test \"$1\" = \"{artifact}\" && test \"$MODULE\" = echo")
            .arg("sh")
            .arg("{artifact}")
            .env("MODULE", "{module}");
        let mut child = command.spawn(&artifact).unwrap();
        assert_eq!(child.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exit_code_is_propagated() {
        let (_home, artifact) = artifact();
        let mut child = SubprocessCommand::new("sh").arg("-c").arg("exit 3").spawn(&artifact).unwrap();
        assert_eq!(child.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn stop_sends_term() {
        let (_home, artifact) = artifact();
        let mut child = SubprocessCommand::new("sleep").arg("30").spawn(&artifact).unwrap();
        assert!(child.pid().is_some());
        child.stop().await.unwrap();
        // SIGTERM = 15
        assert_eq!(child.wait().await.unwrap(), 143);
    }

    #[tokio::test]
    async fn stubborn_child_is_killed_after_grace() {
        let (_home, artifact) = artifact();
        let mut child = SubprocessCommand::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30")
            .kill_after(Some(Duration::from_millis(200)))
            .spawn(&artifact)
            .unwrap();
        // give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        child.stop().await.unwrap();
        // SIGKILL = 9
        assert_eq!(child.wait().await.unwrap(), 137);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let (_home, artifact) = artifact();
        let err = SubprocessCommand::new("/definitely/not/a/program")
            .spawn(&artifact)
            .map(|_| ())
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[test]
    fn exit_code_of_signalled_status() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(2 << 8)), 2);
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }
}
