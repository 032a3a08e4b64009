//! Child-process transport: NDJSON over the child's stdin and stdout.
//!
//! `open` spawns the child through a [`ProcessSupervisor`] and starts a
//! stdout pump that feeds a [`Framer`] and forwards every frame inbound.
//! When stdout reaches EOF the pump consults the supervisor: a non-zero exit
//! closes the inbound stream with [`SdkError::Process`] (exit code plus the
//! captured stderr), anything else with [`SdkError::Closed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConduitConfig, StdioConfig, DEFAULT_STDERR_MAX_BYTES};
use crate::process::ProcessSupervisor;
use crate::protocol::{Framer, MAX_LINE_BYTES};
use crate::transport::{
    forward_frames, BoxFuture, Inbound, InboundRx, InboundTx, Transport, TransportKind,
};
use crate::{Result, SdkError};

/// How long to wait for the child to exit once its stdout has closed.
const EXIT_SETTLE: Duration = Duration::from_secs(2);

/// Limits applied to one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdioOptions {
    /// Ceiling on retained stderr, in bytes.
    pub stderr_max_bytes: usize,
    /// Grace period between SIGTERM and kill.
    pub terminate_grace: Duration,
    /// Ceiling on one stdout line, in bytes.
    pub max_line_bytes: usize,
}

impl Default for StdioOptions {
    fn default() -> Self {
        Self {
            stderr_max_bytes: DEFAULT_STDERR_MAX_BYTES,
            terminate_grace: Duration::from_secs(2),
            max_line_bytes: MAX_LINE_BYTES,
        }
    }
}

impl From<&ConduitConfig> for StdioOptions {
    fn from(config: &ConduitConfig) -> Self {
        Self {
            stderr_max_bytes: config.stderr_max_bytes,
            terminate_grace: config.terminate_grace(),
            max_line_bytes: config.max_line_bytes,
        }
    }
}

struct Running {
    supervisor: Arc<ProcessSupervisor>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

/// Transport speaking to a local child process.
pub struct StdioTransport {
    config: StdioConfig,
    options: StdioOptions,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    running: Mutex<Option<Running>>,
    opened: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("command", &self.config.command)
            .field("opened", &self.opened.load(Ordering::Acquire))
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl StdioTransport {
    /// Create an unopened transport for the child described by `config`.
    #[must_use]
    pub fn new(config: StdioConfig, options: StdioOptions) -> Self {
        Self {
            config,
            options,
            stdin: tokio::sync::Mutex::new(None),
            running: Mutex::new(None),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Captured stderr of the child, empty before `open`.
    #[must_use]
    pub fn stderr_snapshot(&self) -> String {
        self.supervisor()
            .map(|supervisor| supervisor.stderr_snapshot())
            .unwrap_or_default()
    }

    fn supervisor(&self) -> Option<Arc<ProcessSupervisor>> {
        self.lock_running()
            .as_ref()
            .map(|running| Arc::clone(&running.supervisor))
    }

    fn take_running(&self) -> Option<Running> {
        self.lock_running().take()
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open_inner(&self) -> Result<InboundRx> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SdkError::Closed);
        }
        if self.opened.swap(true, Ordering::AcqRel) {
            return Err(SdkError::Sdk("stdio transport already opened".into()));
        }

        let spawned = match ProcessSupervisor::spawn(
            &self.config,
            self.options.stderr_max_bytes,
            self.options.terminate_grace,
        ) {
            Ok(spawned) => spawned,
            Err(err) => {
                self.opened.store(false, Ordering::Release);
                return Err(err);
            }
        };

        let supervisor = Arc::new(spawned.supervisor);
        *self.stdin.lock().await = Some(spawned.stdin);

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let framer = Framer::with_max_line_bytes("stdout", self.options.max_line_bytes);
        let reader = tokio::spawn(pump_stdout(
            spawned.stdout,
            framer,
            tx,
            Arc::clone(&supervisor),
            cancel.clone(),
        ));

        let pid = supervisor.pid();
        *self.lock_running() = Some(Running {
            supervisor,
            cancel,
            reader,
        });
        info!(command = %self.config.command, ?pid, "stdio transport: opened");
        Ok(rx)
    }

    async fn send_inner(&self, message: Value) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SdkError::Closed);
        }
        let supervisor = self.supervisor().ok_or(SdkError::Closed)?;

        // A child that already died reports its exit, not a broken pipe.
        if let Some(failure) = supervisor.exit_failure(Duration::ZERO).await {
            return Err(failure);
        }

        let mut line = serde_json::to_vec(&message)
            .map_err(|err| SdkError::Sdk(format!("failed to serialise outbound message: {err}")))?;
        line.push(b'\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(SdkError::Closed)?;
        let written = match stdin.write_all(&line).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };

        if let Err(err) = written {
            warn!(error = %err, "stdio transport: write to child stdin failed");
            drop(guard);
            if let Some(failure) = supervisor.exit_failure(EXIT_SETTLE).await {
                return Err(failure);
            }
            return Err(SdkError::from_pipe("write to child stdin failed", &err));
        }

        debug!(bytes = line.len(), "stdio transport: message written");
        Ok(())
    }

    async fn close_inner(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // EOF on stdin first; well-behaved children exit on their own.
        self.stdin.lock().await.take();

        if let Some(running) = self.take_running() {
            running.cancel.cancel();
            let state = running.supervisor.terminate().await;
            if let Err(err) = running.reader.await {
                warn!(%err, "stdio transport: stdout pump panicked");
            }
            info!(
                command = %self.config.command,
                exit_code = state.map(|s| s.code),
                "stdio transport: closed"
            );
        }
        Ok(())
    }
}

impl Drop for StdioTransport {
    /// Dropped without `close`: stop the pump so the supervisor is released
    /// and its own teardown terminates the child.
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            debug!(command = %self.config.command, "stdio transport: dropped while open");
            running.cancel.cancel();
        }
    }
}

impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn open(&self) -> BoxFuture<'_, Result<InboundRx>> {
        Box::pin(self.open_inner())
    }

    fn send(&self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.send_inner(message))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.close_inner())
    }

    fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }
}

async fn pump_stdout(
    stdout: ChildStdout,
    mut framer: Framer,
    tx: InboundTx,
    supervisor: Arc<ProcessSupervisor>,
    cancel: CancellationToken,
) {
    let mut chunks = ReaderStream::new(stdout);

    let ended = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(discarded = framer.buffered(), "stdout pump: cancelled");
                framer.reset();
                return;
            }
            chunk = chunks.next() => match chunk {
                Some(Ok(bytes)) => {
                    if !forward_frames(&tx, framer.feed(&bytes)) {
                        debug!("stdout pump: receiver dropped");
                        return;
                    }
                }
                Some(Err(err)) => {
                    break SdkError::from_pipe("read from child stdout failed", &err);
                }
                None => {
                    forward_frames(&tx, framer.finish());
                    break SdkError::Closed;
                }
            }
        }
    };

    let reason = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        failure = supervisor.exit_failure(EXIT_SETTLE) => failure.unwrap_or(ended),
    };
    debug!(error = %reason, "stdout pump: stream ended");
    let _ = tx.send(Inbound::Closed(reason));
}
