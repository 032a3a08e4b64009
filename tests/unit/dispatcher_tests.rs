//! Unit tests for event classification, handler isolation and peer replies.
//!
//! A recording transport stands in for the peer so replies to elicitation
//! and resource requests can be inspected.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_conduit::events::dispatcher::{deliver, INTERNAL_ERROR, METHOD_NOT_FOUND};
use agent_conduit::events::{Event, EventDispatcher, EventHandlerSet};
use agent_conduit::protocol::Message;
use agent_conduit::transport::{BoxFuture, InboundRx, Transport, TransportKind};
use agent_conduit::{Result, SdkError};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<Value>>,
}

impl RecordingTransport {
    fn sent(&self) -> Vec<Value> {
        self.sent.lock().expect("lock").clone()
    }
}

impl Transport for RecordingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn open(&self) -> BoxFuture<'_, Result<InboundRx>> {
        Box::pin(async {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        })
    }

    fn send(&self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.sent.lock().expect("lock").push(message);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn is_open(&self) -> bool {
        true
    }
}

fn event(raw: Value) -> Event {
    Event::from_message(Message::classify(&raw), raw).expect("event")
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn explode() -> Result<()> {
    panic!("handler bug")
}

// ── Category routing ────────────────────────────────────────────────────────

/// A generic notification reaches every notification handler and no other.
#[tokio::test]
async fn notification_reaches_only_its_category() {
    let notified = counter();
    let tools = counter();
    let (n1, n2, t) = (Arc::clone(&notified), Arc::clone(&notified), Arc::clone(&tools));

    let handlers = EventHandlerSet::new()
        .on_notification(move |_| {
            let n1 = Arc::clone(&n1);
            async move {
                n1.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .on_notification(move |_| {
            let n2 = Arc::clone(&n2);
            async move {
                n2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .on_tools_changed(move |_| {
            let t = Arc::clone(&t);
            async move {
                t.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

    let replier = RecordingTransport::default();
    deliver(
        &handlers,
        &replier,
        event(json!({"jsonrpc": "2.0", "method": "progress", "params": {"pct": 5}})),
    )
    .await;

    assert_eq!(notified.load(Ordering::SeqCst), 2);
    assert_eq!(tools.load(Ordering::SeqCst), 0);
    assert!(replier.sent().is_empty(), "notifications are never answered");
}

/// Tool-list changes carry the added and removed tool names.
#[tokio::test]
async fn tools_changed_handler_sees_tool_lists() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handlers = EventHandlerSet::new().on_tools_changed(move |change| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock()
                .expect("lock")
                .push((change.added_tools, change.removed_tools));
            Ok(())
        }
    });

    deliver(
        &handlers,
        &RecordingTransport::default(),
        event(json!({"type": "tools_changed", "added_tools": ["Grep"], "removed_tools": ["Bash"]})),
    )
    .await;

    let seen = seen.lock().expect("lock");
    assert_eq!(
        *seen,
        vec![(vec!["Grep".to_owned()], vec!["Bash".to_owned()])]
    );
}

// ── Isolation ───────────────────────────────────────────────────────────────

/// A failing or panicking handler does not stop later handlers.
#[tokio::test]
async fn failing_handlers_are_contained() {
    let reached = counter();
    let r = Arc::clone(&reached);
    let handlers = EventHandlerSet::new()
        .on_notification(|_| async { Err(SdkError::Sdk("handler refused".into())) })
        .on_notification(|_| async { explode() })
        .on_notification(move |_| {
            let r = Arc::clone(&r);
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

    deliver(
        &handlers,
        &RecordingTransport::default(),
        event(json!({"method": "log"})),
    )
    .await;

    assert_eq!(reached.load(Ordering::SeqCst), 1);
}

// ── Replies ─────────────────────────────────────────────────────────────────

/// The first successful elicitation handler answers the peer.
#[tokio::test]
async fn elicitation_answer_is_sent_back() {
    let handlers = EventHandlerSet::new()
        .on_elicitation_request(|_| async { Err(SdkError::Sdk("not me".into())) })
        .on_elicitation_request(|request| async move { Ok(format!("yes to {}", request.prompt)) });

    let replier = RecordingTransport::default();
    deliver(
        &handlers,
        &replier,
        event(json!({"type": "elicitation_request", "id": "e1", "prompt": "Proceed?"})),
    )
    .await;

    assert_eq!(
        replier.sent(),
        vec![json!({"jsonrpc": "2.0", "id": "e1", "result": {"response": "yes to Proceed?"}})]
    );
}

/// A resource request nobody handles is answered with method-not-found.
#[tokio::test]
async fn unhandled_request_gets_method_not_found() {
    let replier = RecordingTransport::default();
    deliver(
        &EventHandlerSet::new(),
        &replier,
        event(json!({"jsonrpc": "2.0", "id": 9, "method": "resources/read", "params": {"uri": "a"}})),
    )
    .await;

    let sent = replier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["id"], 9);
    assert_eq!(sent[0]["error"]["code"], METHOD_NOT_FOUND);
}

/// When every request handler fails the peer gets an internal error.
#[tokio::test]
async fn failed_request_gets_internal_error() {
    let handlers = EventHandlerSet::new()
        .on_resource_request(|_| async { Err(SdkError::Sdk("disk gone".into())) });

    let replier = RecordingTransport::default();
    deliver(
        &handlers,
        &replier,
        event(json!({"type": "resource_request", "id": "r1", "name": "README.md"})),
    )
    .await;

    let sent = replier.sent();
    assert_eq!(sent[0]["error"]["code"], INTERNAL_ERROR);
    assert!(sent[0]["error"]["message"]
        .as_str()
        .expect("message")
        .contains("disk gone"));
}

// ── Dispatcher task ─────────────────────────────────────────────────────────

/// Events queued on the dispatcher are delivered in arrival order.
#[tokio::test]
async fn dispatcher_preserves_arrival_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&order);
    let handlers = EventHandlerSet::new().on_notification(move |note| {
        let sink = Arc::clone(&sink);
        async move {
            // Earlier events sleep longer; order must still hold.
            let delay = 30 - note.params["n"].as_u64().unwrap_or(0) * 10;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            sink.lock().expect("lock").push(note.method);
            Ok(())
        }
    });

    let dispatcher = EventDispatcher::spawn(
        handlers,
        Arc::new(RecordingTransport::default()),
        CancellationToken::new(),
    );
    for n in 0..3 {
        assert!(dispatcher.dispatch(event(json!({"method": format!("m{n}"), "params": {"n": n}}))));
    }
    dispatcher.finish().await;

    assert_eq!(*order.lock().expect("lock"), vec!["m0", "m1", "m2"]);
}
