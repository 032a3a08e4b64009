//! Runtime configuration parsing and validation.
//!
//! The options layer that builds these records lives outside this crate;
//! here they are plain data, loadable from TOML for the `conduit` binary and
//! tests:
//!
//! ```toml
//! stderr_max_bytes = 65536
//! call_timeout_seconds = 300
//!
//! [transport]
//! type = "stdio"
//! command = "claude"
//! args = ["--output-format", "stream-json", "--input-format", "stream-json", "--verbose"]
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::MAX_LINE_BYTES;
use crate::{Result, SdkError};

/// Default stderr ceiling: 64 KiB.
pub const DEFAULT_STDERR_MAX_BYTES: usize = 64 * 1024;

/// Default `tool_name` of HTTP `invoke` requests.
pub const DEFAULT_TOOL_NAME: &str = "claude_code";

/// Transport selection, discriminated by the `type` key.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Local child process speaking NDJSON over stdin/stdout.
    Stdio(StdioConfig),
    /// Remote service speaking JSON-RPC over HTTP.
    Http(HttpConfig),
}

/// Child-process transport settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StdioConfig {
    /// Executable name or path.
    pub command: String,
    /// Arguments passed verbatim.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory; inherits the parent's when absent.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Whether the child inherits the parent environment.
    #[serde(default = "default_true")]
    pub inherit_env: bool,
}

impl StdioConfig {
    /// Settings for `command` with no arguments.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            inherit_env: true,
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Reconnection policy for the HTTP event channel: a fixed number of
/// retries separated by a fixed delay.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReconnectPolicy {
    /// Attempts after the first disconnect before the transport gives up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between attempts, in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl ReconnectPolicy {
    /// Delay between attempts.
    #[must_use]
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// HTTP transport settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HttpConfig {
    /// Service base URL (`http://` or `https://`).
    pub base_url: String,
    /// Headers sent on every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-request timeout for RPC POSTs; 0 disables.
    #[serde(default = "default_http_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Sub-path receiving JSON-RPC POSTs.
    #[serde(default = "default_rpc_path")]
    pub rpc_path: String,
    /// Sub-path of the server-push event channel.
    #[serde(default = "default_events_path")]
    pub events_path: String,
    /// Event-channel reconnection policy.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// `tool_name` sent with every prompt wrapped in an `invoke` request.
    #[serde(default = "default_tool_name")]
    pub tool_name: String,
}

impl HttpConfig {
    /// Settings for `base_url` with default paths and timeouts.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            headers: HashMap::new(),
            timeout_seconds: default_http_timeout_seconds(),
            rpc_path: default_rpc_path(),
            events_path: default_events_path(),
            reconnect: ReconnectPolicy::default(),
            tool_name: default_tool_name(),
        }
    }

    /// Per-request timeout, `None` when disabled.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }

    /// Absolute URL of the RPC endpoint.
    #[must_use]
    pub fn rpc_url(&self) -> String {
        join_url(&self.base_url, &self.rpc_path)
    }

    /// Absolute URL of the event channel.
    #[must_use]
    pub fn events_url(&self) -> String {
        join_url(&self.base_url, &self.events_path)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_http_timeout_seconds() -> u64 {
    300
}

fn default_rpc_path() -> String {
    "/invoke".into()
}

fn default_tool_name() -> String {
    DEFAULT_TOOL_NAME.into()
}

fn default_events_path() -> String {
    "/events".into()
}

fn default_stderr_max_bytes() -> usize {
    DEFAULT_STDERR_MAX_BYTES
}

fn default_call_timeout_seconds() -> u64 {
    300
}

fn default_terminate_grace_ms() -> u64 {
    2000
}

fn default_max_line_bytes() -> usize {
    MAX_LINE_BYTES
}

/// Complete runtime configuration. Immutable once a transport is built from it.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConduitConfig {
    /// Which transport to use and how to reach the peer.
    pub transport: TransportConfig,
    /// Ceiling on retained child stderr, in bytes.
    #[serde(default = "default_stderr_max_bytes")]
    pub stderr_max_bytes: usize,
    /// Default per-call timeout; 0 disables.
    #[serde(default = "default_call_timeout_seconds")]
    pub call_timeout_seconds: u64,
    /// Grace period between SIGTERM and kill.
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    /// Ceiling on a single framed line, in bytes.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl ConduitConfig {
    /// Configuration for `transport` with every other knob at its default.
    #[must_use]
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            stderr_max_bytes: default_stderr_max_bytes(),
            call_timeout_seconds: default_call_timeout_seconds(),
            terminate_grace_ms: default_terminate_grace_ms(),
            max_line_bytes: default_max_line_bytes(),
        }
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| SdkError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Default per-call timeout, `None` when disabled.
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_seconds > 0).then(|| Duration::from_secs(self.call_timeout_seconds))
    }

    /// Grace period between graceful and forced termination.
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Config` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.stderr_max_bytes == 0 {
            return Err(SdkError::Config(
                "stderr_max_bytes must be greater than zero".into(),
            ));
        }

        if self.max_line_bytes == 0 {
            return Err(SdkError::Config(
                "max_line_bytes must be greater than zero".into(),
            ));
        }

        match &self.transport {
            TransportConfig::Stdio(stdio) => {
                if stdio.command.trim().is_empty() {
                    return Err(SdkError::Config("stdio command must not be empty".into()));
                }
            }
            TransportConfig::Http(http) => {
                if !(http.base_url.starts_with("http://") || http.base_url.starts_with("https://"))
                {
                    return Err(SdkError::Config(format!(
                        "base_url must be an http(s) URL, got {}",
                        http.base_url
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Join a base URL and a sub-path with exactly one `/` between them.
fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_owned()
    } else {
        format!("{base}/{path}")
    }
}
