//! Child process supervisor.
//!
//! Owns one child for its whole lifetime:
//! - spawns it with piped stdio and `kill_on_drop(true)`;
//! - pumps stderr into a [`StderrBuffer`] capped at the configured ceiling;
//! - watches for exit and publishes the [`ExitState`] on a `watch` channel;
//! - on [`ProcessSupervisor::terminate`], sends `SIGTERM` (unix), waits the
//!   grace period, then kills.
//!
//! Stdin and stdout are handed back to the caller (the stdio transport),
//! which owns framing and writes.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StdioConfig;
use crate::process::stderr::StderrBuffer;
use crate::{Result, SdkError};

/// Environment variable identifying this runtime to the child.
pub const ENTRYPOINT_ENV: &str = "CLAUDE_CODE_ENTRYPOINT";

/// Value of [`ENTRYPOINT_ENV`].
pub const ENTRYPOINT: &str = "sdk-rust";

/// How long an exit classification waits for the stderr pipe to drain.
const STDERR_DRAIN: Duration = Duration::from_millis(250);

/// Terminal state of the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    /// Exit code; `-signal` when terminated by a signal, `-1` when unknown.
    pub code: i32,
}

impl ExitState {
    /// `true` for a zero exit code.
    #[must_use]
    pub fn success(self) -> bool {
        self.code == 0
    }

    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self { code };
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self { code: -signal };
            }
        }
        Self { code: -1 }
    }
}

/// Stdio handles of a freshly spawned child, plus its supervisor.
#[derive(Debug)]
pub struct SpawnedProcess {
    /// Lifecycle owner.
    pub supervisor: ProcessSupervisor,
    /// Child's stdin.
    pub stdin: ChildStdin,
    /// Child's stdout.
    pub stdout: ChildStdout,
}

/// Lifecycle owner for one child process.
#[derive(Debug)]
pub struct ProcessSupervisor {
    command: String,
    pid: Option<u32>,
    stderr: Arc<Mutex<StderrBuffer>>,
    stderr_done: CancellationToken,
    exit_rx: watch::Receiver<Option<ExitState>>,
    terminate: CancellationToken,
}

impl ProcessSupervisor {
    /// Spawn the child described by `config`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`SdkError::BinaryNotFound`]: the executable cannot be located.
    /// - [`SdkError::ProcessStart`]: any other spawn failure, including a
    ///   missing working directory or a pipe that could not be captured.
    pub fn spawn(
        config: &StdioConfig,
        stderr_ceiling: usize,
        grace: Duration,
    ) -> Result<SpawnedProcess> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        if !config.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&config.env);
        cmd.env(ENTRYPOINT_ENV, ENTRYPOINT);

        if let Some(cwd) = &config.cwd {
            ensure_dir(cwd)?;
            cmd.current_dir(cwd);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| SdkError::from_spawn(&config.command, &err))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SdkError::ProcessStart("failed to capture child stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SdkError::ProcessStart("failed to capture child stdout".into()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| SdkError::ProcessStart("failed to capture child stderr".into()))?;

        let pid = child.id();
        info!(command = %config.command, ?pid, "child process spawned");

        let stderr = Arc::new(Mutex::new(StderrBuffer::new(stderr_ceiling)));
        let stderr_done = CancellationToken::new();
        tokio::spawn(pump_stderr(
            stderr_pipe,
            Arc::clone(&stderr),
            stderr_done.clone(),
        ));

        let (exit_tx, exit_rx) = watch::channel(None);
        let terminate = CancellationToken::new();
        tokio::spawn(watch_exit(
            config.command.clone(),
            child,
            exit_tx,
            terminate.clone(),
            grace,
        ));

        Ok(SpawnedProcess {
            supervisor: Self {
                command: config.command.clone(),
                pid,
                stderr,
                stderr_done,
                exit_rx,
                terminate,
            },
            stdin,
            stdout,
        })
    }

    /// OS process id, if it was available at spawn time.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit state, once the child has exited.
    #[must_use]
    pub fn exit_state(&self) -> Option<ExitState> {
        *self.exit_rx.borrow()
    }

    /// Wait up to `within` for the child to exit.
    pub async fn wait_exit(&self, within: Duration) -> Option<ExitState> {
        let mut rx = self.exit_rx.clone();
        let _ = tokio::time::timeout(within, rx.wait_for(Option::is_some)).await;
        self.exit_state()
    }

    /// Current stderr contents (bounded by the ceiling).
    #[must_use]
    pub fn stderr_snapshot(&self) -> String {
        lock(&self.stderr).snapshot()
    }

    /// Classify the child's exit, waiting up to `within` for it.
    ///
    /// Returns `None` while the child is running or after a zero exit, and
    /// [`SdkError::Process`] with the captured stderr after a non-zero exit.
    pub async fn exit_failure(&self, within: Duration) -> Option<SdkError> {
        let state = self.wait_exit(within).await?;
        if state.success() {
            return None;
        }
        let _ = tokio::time::timeout(STDERR_DRAIN, self.stderr_done.cancelled()).await;
        Some(SdkError::process(state.code, self.stderr_snapshot()))
    }

    /// Terminate the child: `SIGTERM`, grace period, then kill.
    ///
    /// Idempotent; returns the exit state once the child is gone.
    pub async fn terminate(&self) -> Option<ExitState> {
        if let Some(state) = self.exit_state() {
            return Some(state);
        }
        debug!(command = %self.command, pid = ?self.pid, "terminating child process");
        self.terminate.cancel();
        let mut rx = self.exit_rx.clone();
        let _ = rx.wait_for(Option::is_some).await;
        self.exit_state()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.terminate.cancel();
    }
}

fn ensure_dir(cwd: &Path) -> Result<()> {
    if cwd.is_dir() {
        Ok(())
    } else {
        Err(SdkError::ProcessStart(format!(
            "working directory does not exist: {}",
            cwd.display()
        )))
    }
}

fn lock(buffer: &Mutex<StderrBuffer>) -> MutexGuard<'_, StderrBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn pump_stderr(
    pipe: ChildStderr,
    buffer: Arc<Mutex<StderrBuffer>>,
    done: CancellationToken,
) {
    let mut chunks = ReaderStream::new(pipe);
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(bytes) => lock(&buffer).push(&bytes),
            Err(err) => {
                debug!(error = %err, "stderr pump: read failed, stopping");
                break;
            }
        }
    }
    let retained = {
        let mut guard = lock(&buffer);
        guard.flush_partial();
        guard.retained_bytes()
    };
    debug!(retained, "stderr pump: pipe closed");
    done.cancel();
}

async fn watch_exit(
    command: String,
    mut child: Child,
    exit_tx: watch::Sender<Option<ExitState>>,
    terminate: CancellationToken,
    grace: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = terminate.cancelled() => shutdown(&mut child, grace).await,
    };

    let state = match status {
        Ok(status) => ExitState::from_status(status),
        Err(err) => {
            warn!(command, %err, "error waiting for child process");
            ExitState { code: -1 }
        }
    };

    info!(command, exit_code = state.code, "child process exited");
    let _ = exit_tx.send(Some(state));
}

async fn shutdown(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if let Some(status) = graceful_stop(child, grace).await {
        return status;
    }
    child.kill().await?;
    child.wait().await
}

#[cfg(unix)]
async fn graceful_stop(
    child: &mut Child,
    grace: Duration,
) -> Option<std::io::Result<ExitStatus>> {
    let pid = child.id()?;
    send_sigterm(pid);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Some(status),
        Err(_elapsed) => {
            warn!(pid, ?grace, "child ignored SIGTERM within grace period, killing");
            None
        }
    }
}

#[cfg(not(unix))]
async fn graceful_stop(
    _child: &mut Child,
    _grace: Duration,
) -> Option<std::io::Result<ExitStatus>> {
    None
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid, %err, "SIGTERM delivery failed");
    }
}
