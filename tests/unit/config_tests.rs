//! Unit tests for TOML configuration parsing and validation.

use std::io::Write;
use std::time::Duration;

use agent_conduit::config::{ConduitConfig, HttpConfig, StdioConfig, TransportConfig};
use agent_conduit::SdkError;

// ── Stdio ───────────────────────────────────────────────────────────────────

#[test]
fn stdio_config_parses_with_defaults() {
    let config = ConduitConfig::from_toml_str(
        r#"
        [transport]
        type = "stdio"
        command = "claude"
        args = ["--output-format", "stream-json"]
        "#,
    )
    .expect("valid config");

    let TransportConfig::Stdio(stdio) = &config.transport else {
        panic!("expected stdio transport");
    };
    assert_eq!(stdio.command, "claude");
    assert_eq!(stdio.args, vec!["--output-format", "stream-json"]);
    assert!(stdio.inherit_env);
    assert!(stdio.cwd.is_none());

    assert_eq!(config.stderr_max_bytes, 64 * 1024);
    assert_eq!(config.call_timeout(), Some(Duration::from_secs(300)));
    assert_eq!(config.terminate_grace(), Duration::from_millis(2000));
    assert_eq!(config.max_line_bytes, 1_048_576);
}

#[test]
fn stdio_env_and_cwd_are_read() {
    let config = ConduitConfig::from_toml_str(
        r#"
        call_timeout_seconds = 0
        [transport]
        type = "stdio"
        command = "claude"
        cwd = "/tmp"
        inherit_env = false
        [transport.env]
        ANTHROPIC_LOG = "debug"
        "#,
    )
    .expect("valid config");

    let TransportConfig::Stdio(stdio) = &config.transport else {
        panic!("expected stdio transport");
    };
    assert_eq!(stdio.env.get("ANTHROPIC_LOG").map(String::as_str), Some("debug"));
    assert!(!stdio.inherit_env);
    assert_eq!(config.call_timeout(), None);
}

// ── Http ────────────────────────────────────────────────────────────────────

#[test]
fn http_config_builds_endpoint_urls() {
    let config = ConduitConfig::from_toml_str(
        r#"
        [transport]
        type = "http"
        base_url = "http://127.0.0.1:8080/"
        timeout_seconds = 30
        [transport.headers]
        Authorization = "Bearer token"
        [transport.reconnect]
        max_retries = 5
        "#,
    )
    .expect("valid config");

    let TransportConfig::Http(http) = &config.transport else {
        panic!("expected http transport");
    };
    assert_eq!(http.rpc_url(), "http://127.0.0.1:8080/invoke");
    assert_eq!(http.events_url(), "http://127.0.0.1:8080/events");
    assert_eq!(http.timeout(), Some(Duration::from_secs(30)));
    assert_eq!(http.reconnect.max_retries, 5);
    assert_eq!(http.tool_name, "claude_code");
    assert_eq!(http.reconnect.backoff(), Duration::from_millis(500));
    assert_eq!(
        http.headers.get("Authorization").map(String::as_str),
        Some("Bearer token")
    );
}

// ── Validation ──────────────────────────────────────────────────────────────

#[test]
fn non_http_base_url_is_rejected() {
    let err = ConduitConfig::from_toml_str(
        r#"
        [transport]
        type = "http"
        base_url = "ftp://example.com"
        "#,
    )
    .expect_err("invalid url");
    assert!(matches!(err, SdkError::Config(ref msg) if msg.contains("base_url")));
}

#[test]
fn empty_command_is_rejected() {
    let err = ConduitConfig::new(TransportConfig::Stdio(StdioConfig::new("  ")))
        .validate()
        .expect_err("empty command");
    assert!(matches!(err, SdkError::Config(_)));
}

#[test]
fn zero_stderr_ceiling_is_rejected() {
    let mut config = ConduitConfig::new(TransportConfig::Http(HttpConfig::new("http://h")));
    config.stderr_max_bytes = 0;
    assert!(matches!(config.validate(), Err(SdkError::Config(_))));
}

#[test]
fn unknown_transport_type_is_rejected() {
    let err = ConduitConfig::from_toml_str(
        r#"
        [transport]
        type = "carrier-pigeon"
        "#,
    )
    .expect_err("unknown type");
    assert!(err.to_string().starts_with("config: invalid config"));
}

// ── Loading from disk ───────────────────────────────────────────────────────

#[test]
fn load_from_path_reads_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        "[transport]\ntype = \"stdio\"\ncommand = \"sh\"\nargs = [\"-c\", \"cat\"]"
    )
    .expect("write config");

    let config = ConduitConfig::load_from_path(file.path()).expect("load");
    assert!(matches!(config.transport, TransportConfig::Stdio(ref s) if s.command == "sh"));
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = ConduitConfig::load_from_path(dir.path().join("absent.toml")).expect_err("missing");
    assert!(matches!(err, SdkError::Config(ref msg) if msg.contains("failed to read config")));
}
