//! Request/response correlation.
//!
//! The correlator multiplexes one message stream into any number of logical
//! calls. [`Correlator::register`] allocates an identifier and a
//! single-resolution slot; [`Correlator::route`] hands every inbound message
//! either to the waiting slot or back to the caller as unsolicited traffic.
//!
//! Identifiers are allocated per instance (no process-wide counter), so
//! independent connections never interfere. An identifier is only reused
//! after its entry has left the pending map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::{Message, RequestId};
use crate::{Result, SdkError};

/// One outstanding call.
#[derive(Debug)]
struct PendingCall {
    method: String,
    created_at: Instant,
    slot: oneshot::Sender<Result<Value>>,
}

#[derive(Debug, Default)]
struct State {
    pending: HashMap<RequestId, PendingCall>,
    /// Set once the transport is gone; later registrations fail with it.
    closed: Option<SdkError>,
}

/// Outcome of routing one inbound message.
#[derive(Debug)]
pub enum Routed {
    /// A pending call was resolved.
    Resolved(RequestId),
    /// A reply matched nothing pending and was discarded.
    Stale(Option<RequestId>),
    /// Not a reply: a notification or a peer-initiated request.
    Unsolicited(Message),
}

/// Receiving half of a registered call.
#[derive(Debug)]
pub struct PendingReply {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingReply {
    /// Identifier allocated for this call.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the call to resolve.
    ///
    /// # Errors
    ///
    /// The peer-reported or transport-wide failure the call resolved with;
    /// [`SdkError::Closed`] if the slot was dropped unresolved.
    pub async fn wait(self) -> Result<Value> {
        self.rx.await.unwrap_or(Err(SdkError::Closed))
    }
}

/// Pending-call table for one connection.
#[derive(Debug)]
pub struct Correlator {
    next_id: AtomicI64,
    state: Mutex<State>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Create an empty correlator; the first allocated id is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            state: Mutex::new(State::default()),
        }
    }

    /// Register a new call for `method`.
    ///
    /// # Errors
    ///
    /// The error the correlator was closed with, if it is closed.
    pub fn register(&self, method: &str) -> Result<PendingReply> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }
        let id = self.unused_id(&state);
        Ok(insert(&mut state, id, method))
    }

    /// Register a call under an identifier chosen by the caller, such as
    /// the `request_id` of a control request.
    ///
    /// # Errors
    ///
    /// The error the correlator was closed with, or [`SdkError::Sdk`] when
    /// `id` is already pending.
    pub fn register_as(&self, id: RequestId, method: &str) -> Result<PendingReply> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }
        if state.pending.contains_key(&id) {
            return Err(SdkError::Sdk(format!("request id {id} is already pending")));
        }
        Ok(insert(&mut state, id, method))
    }

    /// Allocate an identifier without registering a call for it.
    ///
    /// Streamed requests use this: their answer arrives on the conversation
    /// stream rather than through a reply slot.
    ///
    /// # Errors
    ///
    /// The error the correlator was closed with, if it is closed.
    pub fn allocate(&self) -> Result<RequestId> {
        let state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }
        Ok(self.unused_id(&state))
    }

    /// Route one inbound message.
    pub fn route(&self, message: Message) -> Routed {
        match message {
            Message::Response { id, result } => self.settle(id, Ok(result)),
            Message::ErrorResponse {
                id: Some(id),
                error,
            } => self.settle(id, Err(SdkError::from(error))),
            Message::ErrorResponse { id: None, error } => {
                warn!(
                    code = error.code,
                    message = %error.message,
                    "correlator: uncorrelated error response, discarding"
                );
                Routed::Stale(None)
            }
            other => Routed::Unsolicited(other),
        }
    }

    /// Resolve the call registered under `id`.
    ///
    /// Returns `false` when nothing is pending under `id`.
    pub fn resolve(&self, id: &RequestId, outcome: Result<Value>) -> bool {
        let Some(call) = self.lock().pending.remove(id) else {
            return false;
        };
        debug!(
            %id,
            method = %call.method,
            elapsed_ms = call.created_at.elapsed().as_millis(),
            ok = outcome.is_ok(),
            "correlator: call resolved"
        );
        if call.slot.send(outcome).is_err() {
            debug!(%id, "correlator: waiter dropped before resolution");
        }
        true
    }

    /// Forget the call registered under `id` (timeout or cancellation).
    ///
    /// A reply arriving later is treated as stale.
    pub fn abandon(&self, id: &RequestId) -> bool {
        let removed = self.lock().pending.remove(id).is_some();
        if removed {
            debug!(%id, "correlator: call abandoned");
        }
        removed
    }

    /// Fail every outstanding call with `reason` and refuse new ones.
    ///
    /// Idempotent: the first reason is kept. Returns how many calls were failed.
    pub fn close(&self, reason: SdkError) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.clone());
            }
            state.pending.drain().collect()
        };

        let failed = drained.len();
        for (id, call) in drained {
            debug!(%id, method = %call.method, error = %reason, "correlator: failing pending call");
            let _ = call.slot.send(Err(reason.clone()));
        }
        failed
    }

    /// Number of calls awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// `true` once [`Correlator::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    fn unused_id(&self, state: &State) -> RequestId {
        loop {
            let candidate = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
            if !state.pending.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn settle(&self, id: RequestId, outcome: Result<Value>) -> Routed {
        if self.resolve(&id, outcome) {
            Routed::Resolved(id)
        } else {
            warn!(%id, "correlator: reply for unknown id, discarding as stale");
            Routed::Stale(Some(id))
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn insert(state: &mut State, id: RequestId, method: &str) -> PendingReply {
    let (slot, rx) = oneshot::channel();
    state.pending.insert(
        id.clone(),
        PendingCall {
            method: method.to_owned(),
            created_at: Instant::now(),
            slot,
        },
    );
    debug!(%id, method, "correlator: call registered");
    PendingReply { id, rx }
}
