#![forbid(unsafe_code)]

//! `conduit`: send one prompt to a coding-assistant peer and stream the
//! conversation back as JSON lines.
//!
//! Opens the transport described by the configuration file, sends the
//! prompt, prints every conversation message on stdout until the `result`
//! record, and logs peer events on stderr.

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conduit::events::EventHandlerSet;
use agent_conduit::{AgentClient, ConduitConfig, Result, SdkError};

/// How long a signal-triggered interrupt waits for the peer's acknowledgement.
const INTERRUPT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "conduit", about = "Talk to a coding-assistant process", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Prompt to send; read from stdin when omitted.
    #[arg(long)]
    prompt: Option<String>,

    /// Session identifier attached to the prompt.
    #[arg(long)]
    session: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| SdkError::Sdk(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = ConduitConfig::load_from_path(&args.config)?;
    info!(path = %args.config.display(), "configuration loaded");

    let prompt = match args.prompt {
        Some(prompt) => prompt,
        None => read_stdin_prompt()?,
    };

    // ── Connect ─────────────────────────────────────────
    let client = AgentClient::connect(&config, logging_handlers()).await?;

    // ── Converse until the result record or a signal ────
    let outcome = tokio::select! {
        outcome = converse(&client, &prompt, args.session.as_deref()) => outcome,
        () = shutdown_signal() => {
            info!("shutdown signal received, interrupting");
            match tokio::time::timeout(INTERRUPT_WAIT, client.interrupt()).await {
                Ok(Ok(())) => info!("interrupt acknowledged"),
                Ok(Err(err)) => warn!(%err, "interrupt failed"),
                Err(_) => warn!(wait = ?INTERRUPT_WAIT, "interrupt not acknowledged"),
            }
            Ok(())
        }
    };

    if let Err(err) = client.disconnect().await {
        error!(%err, "disconnect failed");
    }
    if let Err(err) = &outcome {
        error!(%err, category = ?err.category(), hint = ?err.hint(), "conversation failed");
    }
    outcome
}

async fn converse(client: &AgentClient, prompt: &str, session: Option<&str>) -> Result<()> {
    client.query(prompt, session).await?;

    loop {
        match client.receive_messages().await {
            Some(Ok(message)) => {
                println!("{message}");
                if message.get("type").and_then(Value::as_str) == Some("result") {
                    return Ok(());
                }
            }
            Some(Err(SdkError::Decode { .. })) => {}
            Some(Err(err)) => return Err(err),
            None => return Err(SdkError::Closed),
        }
    }
}

fn logging_handlers() -> EventHandlerSet {
    EventHandlerSet::new()
        .on_notification(|event| async move {
            info!(method = %event.method, "peer notification");
            Ok::<_, SdkError>(())
        })
        .on_tools_changed(|event| async move {
            info!(
                added = ?event.added_tools,
                removed = ?event.removed_tools,
                "peer tools changed"
            );
            Ok::<_, SdkError>(())
        })
}

fn read_stdin_prompt() -> Result<String> {
    let mut prompt = String::new();
    std::io::stdin()
        .read_to_string(&mut prompt)
        .map_err(|err| SdkError::Config(format!("failed to read prompt from stdin: {err}")))?;
    let prompt = prompt.trim().to_owned();
    if prompt.is_empty() {
        return Err(SdkError::Config("no prompt given".into()));
    }
    Ok(prompt)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| SdkError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| SdkError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
