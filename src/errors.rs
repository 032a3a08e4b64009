//! Error taxonomy shared by every layer of the runtime.
//!
//! Every failure path (spawn, pipe I/O, framing, process exit, peer-reported
//! JSON-RPC errors, HTTP) funnels through one of the constructors below so a
//! caller only ever matches on [`SdkError`].

use std::fmt::{Display, Formatter};
use std::io;
use std::time::Duration;

use serde_json::Value;

use crate::protocol::message::RpcError;

/// Shared result type.
pub type Result<T> = std::result::Result<T, SdkError>;

/// Runtime error enumeration.
///
/// `Clone` because transport-wide failures are broadcast to every caller
/// waiting on the connection.
#[derive(Debug, Clone)]
pub enum SdkError {
    /// The configured executable could not be located.
    BinaryNotFound {
        /// Command as given in the configuration.
        command: String,
    },
    /// Any other OS-level failure while starting the child process.
    ProcessStart(String),
    /// Broken pipe, connect failure, HTTP status failure.
    Connection(String),
    /// The transport was closed while the operation was outstanding.
    Closed,
    /// The child process exited with a non-zero status.
    Process {
        /// Exit code; `-signal` when the child was killed by a signal.
        exit_code: i32,
        /// Most recent stderr content, bounded by the stderr ceiling.
        stderr: String,
    },
    /// A line intended as JSON failed to decode.
    Decode {
        /// Identity of the stream the text arrived on (`stdout`, `http:events`, …).
        stream: String,
        /// Offending raw text.
        raw: String,
        /// Parser diagnostic.
        reason: String,
    },
    /// The peer answered a call with a JSON-RPC error object.
    ToolExecution {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable message.
        message: String,
        /// Optional structured detail, preserved verbatim.
        data: Option<Value>,
    },
    /// A call or HTTP request did not complete in time.
    Timeout(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// Anything else.
    Sdk(String),
}

/// Taxonomy bucket an [`SdkError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Executable missing.
    BinaryNotFound,
    /// Spawn failed for another reason.
    ProcessStart,
    /// Pipe, network or premature close.
    Connection,
    /// Non-zero child exit.
    Process,
    /// Malformed JSON.
    Decode,
    /// Peer-reported JSON-RPC error.
    ToolExecution,
    /// Deadline elapsed.
    Timeout,
    /// Generic SDK failure.
    Generic,
}

impl SdkError {
    /// Bucket this error belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::BinaryNotFound { .. } => ErrorCategory::BinaryNotFound,
            Self::ProcessStart(_) => ErrorCategory::ProcessStart,
            Self::Connection(_) | Self::Closed => ErrorCategory::Connection,
            Self::Process { .. } => ErrorCategory::Process,
            Self::Decode { .. } => ErrorCategory::Decode,
            Self::ToolExecution { .. } => ErrorCategory::ToolExecution,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Config(_) | Self::Sdk(_) => ErrorCategory::Generic,
        }
    }

    /// `true` for errors that mean the transport is gone.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Connection(_) | Self::Process { .. }
        )
    }

    /// The `data.hint` field of a peer-reported error, if present.
    #[must_use]
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::ToolExecution {
                data: Some(data), ..
            } => data.get("hint").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Map a failed `Command::spawn` for `command`.
    #[must_use]
    pub fn from_spawn(command: &str, err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::BinaryNotFound {
                command: command.to_owned(),
            }
        } else {
            Self::ProcessStart(format!("failed to start {command}: {err}"))
        }
    }

    /// Map an I/O failure on an established pipe or socket.
    #[must_use]
    pub fn from_pipe(context: &str, err: &io::Error) -> Self {
        Self::Connection(format!("{context}: {err}"))
    }

    /// Build a decode error carrying the offending text.
    #[must_use]
    pub fn decode(stream: &str, raw: &str, err: &serde_json::Error) -> Self {
        Self::Decode {
            stream: stream.to_owned(),
            raw: raw.to_owned(),
            reason: err.to_string(),
        }
    }

    /// Build a process failure from an exit code and captured stderr.
    #[must_use]
    pub fn process(exit_code: i32, stderr: String) -> Self {
        Self::Process { exit_code, stderr }
    }

    /// Build a timeout for `what` after `after`.
    #[must_use]
    pub fn timeout(what: &str, after: Duration) -> Self {
        Self::Timeout(format!("{what} did not complete within {after:?}"))
    }
}

impl Display for SdkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BinaryNotFound { command } => write!(f, "binary not found: {command}"),
            Self::ProcessStart(msg) => write!(f, "process start: {msg}"),
            Self::Connection(msg) => write!(f, "connection: {msg}"),
            Self::Closed => write!(f, "connection: closed"),
            Self::Process { exit_code, stderr } => {
                write!(f, "process: exited with code {exit_code}")?;
                if !stderr.is_empty() {
                    write!(f, "; stderr: {stderr}")?;
                }
                Ok(())
            }
            Self::Decode { stream, raw, reason } => {
                write!(f, "decode: {stream}: {reason}: {raw}")
            }
            Self::ToolExecution { code, message, .. } => {
                write!(f, "tool execution: {message} (code {code})")
            }
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Sdk(msg) => write!(f, "sdk: {msg}"),
        }
    }
}

impl std::error::Error for SdkError {}

impl From<RpcError> for SdkError {
    fn from(err: RpcError) -> Self {
        Self::ToolExecution {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

impl From<toml::de::Error> for SdkError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<reqwest::Error> for SdkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(format!("http request timed out: {err}"))
        } else if let Some(status) = err.status() {
            Self::Connection(format!("http status {status}"))
        } else {
            Self::Connection(format!("http request failed: {err}"))
        }
    }
}
