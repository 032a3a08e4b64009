//! Conversational façade over a [`Connection`].
//!
//! [`AgentClient`] speaks the CLI's stream-json dialect: prompts go out as
//! `user` records, the assistant's turns come back on the conversation
//! stream, and a `result` record marks the end of a response. Over HTTP the
//! same `user` record is wrapped in a JSON-RPC `invoke` request whose
//! streamed body carries the turns back.
//!
//! [`query`] is the one-shot form: connect, ask, collect, disconnect.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{ConduitConfig, TransportConfig, DEFAULT_TOOL_NAME};
use crate::events::EventHandlerSet;
use crate::rpc::Connection;
use crate::transport::TransportKind;
use crate::{Result, SdkError};

/// Session used when the caller does not name one.
pub const DEFAULT_SESSION: &str = "default";

/// Method wrapping a prompt on the HTTP transport.
pub const INVOKE_METHOD: &str = "invoke";

/// High-level client for one conversation.
#[derive(Debug)]
pub struct AgentClient {
    connection: Connection,
    /// `tool_name` for `invoke` requests; `None` on the stdio transport.
    tool_name: Option<String>,
}

impl AgentClient {
    /// Open the configured transport with `handlers` registered.
    ///
    /// # Errors
    ///
    /// Whatever opening the transport fails with.
    pub async fn connect(config: &ConduitConfig, handlers: EventHandlerSet) -> Result<Self> {
        let connection = Connection::connect(config, handlers).await?;
        let mut client = Self::from_connection(connection);
        if let TransportConfig::Http(http) = &config.transport {
            client.tool_name = Some(http.tool_name.clone());
        }
        Ok(client)
    }

    /// Wrap an already-open connection.
    ///
    /// Prompts on an HTTP connection are invoked with the default
    /// `tool_name`.
    #[must_use]
    pub fn from_connection(connection: Connection) -> Self {
        let tool_name =
            (connection.kind() == TransportKind::Http).then(|| DEFAULT_TOOL_NAME.to_owned());
        Self {
            connection,
            tool_name,
        }
    }

    /// Underlying connection, for raw calls.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Send a user prompt.
    ///
    /// On stdio the `user` record is written as is. On HTTP it becomes
    /// `{"method": "invoke", "params": {"tool_name", "messages": [record]}}`
    /// and the records streamed back in the response body arrive on the
    /// conversation stream.
    ///
    /// # Errors
    ///
    /// Whatever the transport fails with.
    pub async fn query(&self, prompt: &str, session_id: Option<&str>) -> Result<()> {
        let session_id = session_id.unwrap_or(DEFAULT_SESSION);
        let record = json!({
            "type": "user",
            "message": { "role": "user", "content": prompt },
            "parent_tool_use_id": null,
            "session_id": session_id,
        });

        let Some(tool_name) = &self.tool_name else {
            debug!(session_id, "client: sending prompt");
            return self.connection.send(record).await;
        };
        let id = self
            .connection
            .stream_request(
                INVOKE_METHOD,
                Some(json!({ "tool_name": tool_name, "messages": [record] })),
            )
            .await?;
        debug!(session_id, %id, tool_name = %tool_name, "client: prompt invoked");
        Ok(())
    }

    /// Next conversation message; `None` once the stream is exhausted.
    pub async fn receive_messages(&self) -> Option<Result<Value>> {
        self.connection.next_message().await
    }

    /// Collect messages up to and including the next `result` record.
    ///
    /// Undecodable lines are skipped (they are already logged).
    ///
    /// # Errors
    ///
    /// The failure that ended the transport, or [`SdkError::Closed`] if the
    /// stream ended before a `result` arrived.
    pub async fn receive_response(&self) -> Result<Vec<Value>> {
        let mut collected = Vec::new();
        loop {
            match self.connection.next_message().await {
                Some(Ok(message)) => {
                    let done = message.get("type").and_then(Value::as_str) == Some("result");
                    collected.push(message);
                    if done {
                        return Ok(collected);
                    }
                }
                Some(Err(SdkError::Decode { stream, .. })) => {
                    debug!(stream = %stream, "client: skipping undecodable message");
                }
                Some(Err(err)) => return Err(err),
                None => {
                    warn!(received = collected.len(), "client: stream ended before result");
                    return Err(SdkError::Closed);
                }
            }
        }
    }

    /// Ask the peer to interrupt the current turn and wait for it to
    /// acknowledge.
    ///
    /// # Errors
    ///
    /// [`SdkError::Sdk`] when the peer refuses, [`SdkError::Timeout`] when
    /// it never answers, otherwise whatever the transport fails with.
    pub async fn interrupt(&self) -> Result<()> {
        self.connection
            .control(json!({ "subtype": "interrupt" }))
            .await
            .map(|_| ())
    }

    /// Close the connection. Idempotent.
    ///
    /// # Errors
    ///
    /// Whatever closing the transport fails with.
    pub async fn disconnect(&self) -> Result<()> {
        self.connection.close().await
    }
}

/// Run one prompt to completion.
///
/// Opens the configured transport, sends `prompt`, and collects messages up
/// to and including the `result` record. A message carrying a non-empty
/// `error` becomes [`SdkError::ToolExecution`] (code `-1` and message
/// `Unknown error` when absent). The connection is closed whatever the
/// outcome. A stdio child that exits cleanly before `result` ends the
/// collection early.
///
/// # Errors
///
/// Whatever connecting fails with, the first error message, or the failure
/// that ended the transport. Waiting for each message is bounded by the
/// configured call timeout.
pub async fn query(config: &ConduitConfig, prompt: &str) -> Result<Vec<Value>> {
    let client = AgentClient::connect(config, EventHandlerSet::new()).await?;

    let outcome = async {
        client.query(prompt, None).await?;
        collect_response(&client, config.call_timeout()).await
    }
    .await;

    if let Err(err) = client.disconnect().await {
        warn!(%err, "client: disconnect after query failed");
    }
    outcome
}

async fn collect_response(
    client: &AgentClient,
    limit: Option<std::time::Duration>,
) -> Result<Vec<Value>> {
    let mut collected = Vec::new();
    loop {
        let next = match limit {
            Some(limit) => tokio::time::timeout(limit, client.receive_messages())
                .await
                .map_err(|_| SdkError::timeout("waiting for the next message", limit))?,
            None => client.receive_messages().await,
        };
        match next {
            Some(Ok(message)) => {
                if let Some(err) = error_record(&message) {
                    return Err(err);
                }
                let done = message.get("type").and_then(Value::as_str) == Some("result");
                collected.push(message);
                if done {
                    return Ok(collected);
                }
            }
            Some(Err(SdkError::Decode { stream, .. })) => {
                debug!(stream = %stream, "client: skipping undecodable message");
            }
            Some(Err(err)) => return Err(err),
            None => return Ok(collected),
        }
    }
}

/// The error carried by a message's `error` field, if it holds one.
fn error_record(message: &Value) -> Option<SdkError> {
    let error = message.get("error")?;
    let (code, text, data) = match error {
        Value::Object(fields) if !fields.is_empty() => (
            fields.get("code").and_then(Value::as_i64),
            fields.get("message").and_then(Value::as_str),
            fields.get("data").cloned(),
        ),
        Value::String(text) if !text.is_empty() => (None, Some(text.as_str()), None),
        Value::Bool(true) => (None, None, None),
        _ => return None,
    };
    Some(SdkError::ToolExecution {
        code: code.unwrap_or(-1),
        message: text.unwrap_or("Unknown error").to_owned(),
        data,
    })
}
