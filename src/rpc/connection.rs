//! One open conversation over a transport.
//!
//! A [`Connection`] glues the pieces together: it opens the transport, runs
//! a single inbound pump that classifies every message, and routes it to
//! one of three places:
//!
//! - replies go to the [`Correlator`], which wakes the waiting caller;
//! - conversation turns (`user`, `assistant`, `system`, `result`,
//!   `stream_event`) go to the conversation stream read by
//!   [`Connection::next_message`];
//! - everything else becomes an [`Event`] for the [`EventDispatcher`].
//!
//! Two kinds of request sit between those paths. A streamed request
//! ([`Connection::stream_request`]) is answered by the conversation stream
//! itself, so a reply carrying its id lands there too. A control request
//! ([`Connection::control`]) is answered by a `control_response` record
//! naming its `request_id`, which resolves it like any other call.
//!
//! When the transport goes away on its own (child exit, dropped network
//! channel) the pump fails every pending call with the reason and surfaces
//! it on the conversation stream. [`Connection::close`] does the same with
//! [`SdkError::Closed`] and is idempotent.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConduitConfig;
use crate::events::{Event, EventDispatcher, EventHandlerSet};
use crate::protocol::message::{notification, request};
use crate::protocol::{Message, RequestId};
use crate::rpc::correlator::{Correlator, Routed};
use crate::transport::{self, Inbound, InboundRx, Transport, TransportKind};
use crate::{Result, SdkError};

/// `type` values that form the conversation itself rather than events.
pub const CONVERSATION_TYPES: &[&str] = &["user", "assistant", "system", "result", "stream_event"];

/// Per-connection knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Default timeout applied by [`Connection::call`]; `None` waits forever.
    pub call_timeout: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            call_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl From<&ConduitConfig> for ConnectionSettings {
    fn from(config: &ConduitConfig) -> Self {
        Self {
            call_timeout: config.call_timeout(),
        }
    }
}

type ConversationTx = mpsc::UnboundedSender<Result<Value>>;

/// Ids of streamed requests whose body is still open.
type Streamed = Arc<Mutex<HashSet<RequestId>>>;

/// An open, multiplexed conversation with the peer.
pub struct Connection {
    transport: Arc<dyn Transport>,
    correlator: Arc<Correlator>,
    streamed: Streamed,
    next_control: AtomicU64,
    conversation: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Value>>>,
    settings: ConnectionSettings,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.transport.kind())
            .field("pending", &self.correlator.pending_count())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Build the transport selected by `config` and open it.
    ///
    /// # Errors
    ///
    /// Whatever [`Transport::open`] fails with.
    pub async fn connect(config: &ConduitConfig, handlers: EventHandlerSet) -> Result<Self> {
        Self::open(
            transport::from_config(config),
            handlers,
            ConnectionSettings::from(config),
        )
        .await
    }

    /// Open `transport` and start routing its inbound traffic.
    ///
    /// Handlers are fixed for the lifetime of the connection.
    ///
    /// # Errors
    ///
    /// Whatever [`Transport::open`] fails with.
    pub async fn open(
        transport: Arc<dyn Transport>,
        handlers: EventHandlerSet,
        settings: ConnectionSettings,
    ) -> Result<Self> {
        let inbound = transport.open().await?;

        let correlator = Arc::new(Correlator::new());
        let streamed = Streamed::default();
        let cancel = CancellationToken::new();
        let (conversation_tx, conversation_rx) = mpsc::unbounded_channel();
        let dispatcher =
            EventDispatcher::spawn(handlers, Arc::clone(&transport), cancel.child_token());

        let pump = tokio::spawn(pump_inbound(
            inbound,
            Arc::clone(&correlator),
            Arc::clone(&streamed),
            dispatcher,
            conversation_tx,
            cancel.clone(),
        ));

        info!(kind = ?transport.kind(), "connection: opened");
        Ok(Self {
            transport,
            correlator,
            streamed,
            next_control: AtomicU64::new(1),
            conversation: tokio::sync::Mutex::new(conversation_rx),
            settings,
            cancel,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        })
    }

    /// Underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Kind of the underlying transport.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Issue a request and wait for its reply under the default timeout.
    ///
    /// # Errors
    ///
    /// [`SdkError::ToolExecution`] when the peer answers with an error
    /// object, [`SdkError::Timeout`] when no reply arrives in time, or the
    /// transport-wide failure that closed the connection.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.call_with_timeout(method, params, self.settings.call_timeout)
            .await
    }

    /// Issue a request with an explicit timeout (`None` waits forever).
    ///
    /// On timeout the call is forgotten; a reply arriving later is discarded
    /// as stale.
    ///
    /// # Errors
    ///
    /// As for [`Connection::call`].
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let pending = self.correlator.register(method)?;
        let id = pending.id().clone();

        if let Err(err) = self.transport.send(request(&id, method, params)).await {
            self.correlator.abandon(&id);
            return Err(err);
        }

        let Some(limit) = timeout else {
            return pending.wait().await;
        };

        if let Ok(outcome) = tokio::time::timeout(limit, pending.wait()).await {
            outcome
        } else {
            self.correlator.abandon(&id);
            warn!(%id, method, ?limit, "connection: call timed out");
            Err(SdkError::timeout(&format!("call {method} (id {id})"), limit))
        }
    }

    /// Issue a request whose answer is the conversation itself.
    ///
    /// Nothing waits on a reply slot. Records the peer streams back land on
    /// the conversation stream in order, and a reply carrying the request's
    /// id is delivered there as well (an error reply as `Err`).
    ///
    /// # Errors
    ///
    /// [`SdkError::Closed`] after close, otherwise whatever the transport
    /// fails with.
    pub async fn stream_request(&self, method: &str, params: Option<Value>) -> Result<RequestId> {
        if self.is_closed() {
            return Err(SdkError::Closed);
        }
        let id = self.correlator.allocate()?;
        lock_streamed(&self.streamed).insert(id.clone());

        if let Err(err) = self.transport.send(request(&id, method, params)).await {
            lock_streamed(&self.streamed).remove(&id);
            return Err(err);
        }
        debug!(%id, method, "connection: streamed request sent");
        Ok(id)
    }

    /// Send a stream-json control request and wait for its
    /// `control_response` under the default timeout.
    ///
    /// `request` is the body placed under the record's `request` key; the
    /// `request_id` (`req_1`, `req_2`, ...) is allocated here. Returns the
    /// peer's `response` object.
    ///
    /// # Errors
    ///
    /// [`SdkError::Sdk`] when the peer reports the control request failed,
    /// [`SdkError::Timeout`] when no response arrives in time, or the
    /// transport-wide failure that closed the connection.
    pub async fn control(&self, request: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(SdkError::Closed);
        }
        let n = self.next_control.fetch_add(1, Ordering::Relaxed);
        let request_id = format!("req_{n}");
        let subtype = request
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or("control")
            .to_owned();

        let pending = self
            .correlator
            .register_as(RequestId::String(request_id.clone()), &subtype)?;
        let id = pending.id().clone();

        let record = serde_json::json!({
            "type": "control_request",
            "request_id": request_id,
            "request": request,
        });
        if let Err(err) = self.transport.send(record).await {
            self.correlator.abandon(&id);
            return Err(err);
        }

        let Some(limit) = self.settings.call_timeout else {
            return pending.wait().await;
        };
        if let Ok(outcome) = tokio::time::timeout(limit, pending.wait()).await {
            outcome
        } else {
            self.correlator.abandon(&id);
            warn!(%id, subtype = %subtype, ?limit, "connection: control request timed out");
            Err(SdkError::timeout(&format!("control request {subtype} ({id})"), limit))
        }
    }

    /// Send a JSON-RPC notification.
    ///
    /// # Errors
    ///
    /// [`SdkError::Closed`] after close, otherwise whatever the transport
    /// fails with.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.send(notification(method, params)).await
    }

    /// Send a raw message (for instance a stream-json `user` turn).
    ///
    /// # Errors
    ///
    /// [`SdkError::Closed`] after close, otherwise whatever the transport
    /// fails with.
    pub async fn send(&self, message: Value) -> Result<()> {
        if self.is_closed() {
            return Err(SdkError::Closed);
        }
        self.transport.send(message).await
    }

    /// Next conversation message, in wire order.
    ///
    /// Undecodable lines and the failure that ended the transport appear as
    /// `Err`; `None` once the stream is exhausted.
    pub async fn next_message(&self) -> Option<Result<Value>> {
        self.conversation.lock().await.recv().await
    }

    /// Calls still awaiting a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.correlator.pending_count()
    }

    /// `true` after [`Connection::close`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fail every pending call with [`SdkError::Closed`], stop the pumps and
    /// close the transport. Idempotent.
    ///
    /// # Errors
    ///
    /// Whatever [`Transport::close`] fails with.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let failed = self.correlator.close(SdkError::Closed);
        if failed > 0 {
            debug!(failed, "connection: pending calls failed on close");
        }
        lock_streamed(&self.streamed).clear();
        self.cancel.cancel();

        let result = self.transport.close().await;

        let pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pump) = pump {
            if let Err(err) = pump.await {
                warn!(%err, "connection: inbound pump failed");
            }
        }

        info!(kind = ?self.transport.kind(), "connection: closed");
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.correlator.close(SdkError::Closed);
        self.cancel.cancel();
    }
}

/// `true` for id-less stream-json records that form the conversation.
#[must_use]
pub fn is_conversation(raw: &Value) -> bool {
    raw.get("method").is_none()
        && raw.get("id").is_none()
        && raw
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|kind| CONVERSATION_TYPES.contains(&kind))
}

fn lock_streamed(streamed: &Streamed) -> std::sync::MutexGuard<'_, HashSet<RequestId>> {
    streamed.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Forget `id` as a streamed request; `true` if it was one.
fn take_streamed(streamed: &Streamed, id: &RequestId) -> bool {
    lock_streamed(streamed).remove(id)
}

async fn pump_inbound(
    mut inbound: InboundRx,
    correlator: Arc<Correlator>,
    streamed: Streamed,
    dispatcher: EventDispatcher,
    conversation: ConversationTx,
    cancel: CancellationToken,
) {
    let reason = loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => break SdkError::Closed,
            item = inbound.recv() => item,
        };

        match item {
            None => break SdkError::Closed,
            Some(Inbound::Closed(reason)) => break reason,
            Some(Inbound::Message(raw)) => {
                route(&correlator, &streamed, &dispatcher, &conversation, raw);
            }
            Some(Inbound::Malformed(err)) => {
                warn!(error = %err, "connection: undecodable message");
                let _ = conversation.send(Err(err));
            }
            Some(Inbound::Ended { id }) => {
                if take_streamed(&streamed, &id) {
                    debug!(%id, "connection: streamed response complete");
                } else if correlator.resolve(
                    &id,
                    Err(SdkError::Connection("http response ended without a reply".into())),
                ) {
                    debug!(%id, "connection: call ended without a reply");
                }
            }
            Some(Inbound::Failed { id, error }) => {
                if take_streamed(&streamed, &id) {
                    warn!(%id, %error, "connection: streamed response failed");
                    let _ = conversation.send(Err(error));
                } else if correlator.resolve(&id, Err(error)) {
                    debug!(%id, "connection: call failed by transport");
                }
            }
        }
    };

    let failed = correlator.close(reason.clone());
    if failed > 0 {
        warn!(failed, error = %reason, "connection: transport lost with calls pending");
    }
    if !matches!(reason, SdkError::Closed) {
        let _ = conversation.send(Err(reason));
    }
    drop(conversation);
    dispatcher.finish().await;
    debug!("connection: inbound pump stopped");
}

fn route(
    correlator: &Correlator,
    streamed: &Streamed,
    dispatcher: &EventDispatcher,
    conversation: &ConversationTx,
    raw: Value,
) {
    if is_conversation(&raw) {
        let _ = conversation.send(Ok(raw));
        return;
    }
    if let Some((request_id, outcome)) = control_response(&raw) {
        if correlator.resolve(&request_id, outcome) {
            return;
        }
        debug!(%request_id, "connection: unmatched control response, dispatching as event");
    }

    let message = match Message::classify(&raw) {
        Message::Response { id, result } if take_streamed(streamed, &id) => {
            let _ = conversation.send(Ok(result));
            return;
        }
        Message::ErrorResponse { id: Some(id), error } if take_streamed(streamed, &id) => {
            let _ = conversation.send(Err(SdkError::from(error)));
            return;
        }
        Message::ErrorResponse { id: None, error } => {
            // Nothing to correlate with; the conversation reader sees it.
            warn!(code = error.code, message = %error.message, "connection: uncorrelated error");
            let _ = conversation.send(Err(SdkError::from(error)));
            return;
        }
        other => other,
    };

    let Routed::Unsolicited(message) = correlator.route(message) else {
        return;
    };
    if let Some(event) = Event::from_message(message, raw) {
        if !dispatcher.dispatch(event) {
            debug!("connection: dispatcher stopped, event dropped");
        }
    }
}

/// Split a `control_response` record into the `request_id` it answers and
/// its outcome.
fn control_response(raw: &Value) -> Option<(RequestId, Result<Value>)> {
    if raw.get("type").and_then(Value::as_str) != Some("control_response") {
        return None;
    }
    let response = raw.get("response")?;
    let request_id = response.get("request_id").and_then(Value::as_str)?;

    let outcome = if response.get("subtype").and_then(Value::as_str) == Some("error") {
        let reason = response
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        Err(SdkError::Sdk(format!(
            "control request {request_id} failed: {reason}"
        )))
    } else {
        Ok(response.clone())
    };
    Some((RequestId::from(request_id), outcome))
}
