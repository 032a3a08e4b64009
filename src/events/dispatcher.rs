//! Event delivery task.
//!
//! The inbound pump hands events over through an unbounded channel, so it
//! never waits on a handler. One dispatcher task drains the channel and
//! delivers events strictly in arrival order. Each handler invocation runs
//! as its own tokio task and is awaited, which contains panics as well as
//! errors: both are logged and delivery moves on.
//!
//! Request categories answer the peer through the transport: the first
//! handler that returns `Ok` supplies the reply; if every handler fails the
//! peer gets `-32603`, and with no handler at all `-32601`.

use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::handlers::{ObserveFn, ReplyFn};
use crate::events::{
    ElicitationRequest, Event, EventCategory, EventHandlerSet, NotificationEvent,
    ResourceRequest, ToolsChanged,
};
use crate::protocol::message::{error_response, response};
use crate::protocol::{RequestId, RpcError};
use crate::transport::Transport;
use crate::Result;

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC "internal error".
pub const INTERNAL_ERROR: i64 = -32603;

/// Handle to a running dispatcher task.
#[derive(Debug)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<Event>,
    task: JoinHandle<()>,
}

impl EventDispatcher {
    /// Start the dispatcher. Replies to peer requests go out via `replier`.
    #[must_use]
    pub fn spawn(
        handlers: EventHandlerSet,
        replier: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, handlers, replier, cancel));
        Self { tx, task }
    }

    /// Queue `event` for delivery; `false` once the dispatcher has stopped.
    pub fn dispatch(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Stop accepting events and wait for queued ones to be delivered.
    pub async fn finish(self) {
        drop(self.tx);
        if let Err(err) = self.task.await {
            warn!(%err, "event dispatcher: task failed");
        }
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Event>,
    handlers: EventHandlerSet,
    replier: Arc<dyn Transport>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = deliver(&handlers, replier.as_ref(), event) => {}
        }
    }
    debug!("event dispatcher: stopped");
}

/// Deliver one event to the handlers registered for its category.
pub async fn deliver(handlers: &EventHandlerSet, replier: &dyn Transport, event: Event) {
    debug!(
        method = %event.method,
        category = ?event.category,
        "event dispatcher: delivering"
    );

    match event.category {
        EventCategory::Notification => {
            observe_all(&handlers.notification, &NotificationEvent::from(&event)).await;
        }
        EventCategory::ToolsChanged => {
            observe_all(&handlers.tools_changed, &ToolsChanged::from(&event)).await;
        }
        EventCategory::Elicitation => {
            let outcome =
                first_reply(&handlers.elicitation, &ElicitationRequest::from(&event)).await;
            answer(replier, &event, outcome).await;
        }
        EventCategory::ResourceRequest => {
            let outcome =
                first_reply(&handlers.resource_request, &ResourceRequest::from(&event)).await;
            answer(replier, &event, outcome).await;
        }
    }
}

enum Outcome {
    Replied(String),
    Failed(String),
    Unhandled,
}

async fn observe_all<E>(registered: &[ObserveFn<E>], event: &E)
where
    E: Clone + Send + 'static,
{
    for handler in registered {
        if let Err(reason) = isolate(handler(event.clone())).await {
            warn!(%reason, "event dispatcher: handler failed");
        }
    }
}

async fn first_reply<E>(registered: &[ReplyFn<E>], event: &E) -> Outcome
where
    E: Clone + Send + 'static,
{
    let mut last_failure = None;
    for handler in registered {
        match isolate(handler(event.clone())).await {
            Ok(reply) => return Outcome::Replied(reply),
            Err(reason) => {
                warn!(%reason, "event dispatcher: request handler failed");
                last_failure = Some(reason);
            }
        }
    }
    last_failure.map_or(Outcome::Unhandled, Outcome::Failed)
}

/// Run one handler invocation as its own task so a panic stays contained.
async fn isolate<T, F>(invocation: F) -> std::result::Result<T, String>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    match tokio::spawn(invocation).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(join) => Err(format!("handler panicked: {join}")),
    }
}

async fn answer(replier: &dyn Transport, event: &Event, outcome: Outcome) {
    let Some(id) = &event.id else {
        debug!(method = %event.method, "event dispatcher: request without id, reply dropped");
        return;
    };

    let reply = reply_message(id, &event.method, outcome);
    if let Err(err) = replier.send(reply).await {
        warn!(%id, error = %err, "event dispatcher: failed to answer peer request");
    }
}

/// Wire form of the answer to a peer request.
#[must_use]
fn reply_message(id: &RequestId, method: &str, outcome: Outcome) -> Value {
    match outcome {
        Outcome::Replied(text) => response(id, json!({ "response": text })),
        Outcome::Failed(reason) => error_response(
            id,
            &RpcError {
                code: INTERNAL_ERROR,
                message: reason,
                data: None,
            },
        ),
        Outcome::Unhandled => error_response(
            id,
            &RpcError {
                code: METHOD_NOT_FOUND,
                message: format!("no handler registered for {method}"),
                data: None,
            },
        ),
    }
}
