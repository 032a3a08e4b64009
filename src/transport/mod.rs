//! Transport abstraction over the physical channel.
//!
//! A [`Transport`] moves whole JSON messages. Outbound, [`Transport::send`]
//! writes one message; inbound, the receiver returned by
//! [`Transport::open`] yields framed messages in wire order, terminated by
//! exactly one [`Inbound::Closed`] when the channel goes away on its own.
//!
//! Both variants feed every inbound byte stream through a
//! [`Framer`](crate::protocol::Framer), so the connection layer above sees
//! identical traffic whether it arrived on child stdout, an HTTP response
//! body, or the HTTP event channel.

pub mod http;
pub mod stdio;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{ConduitConfig, TransportConfig};
use crate::protocol::RequestId;
use crate::{Result, SdkError};

pub use http::HttpTransport;
pub use stdio::{StdioOptions, StdioTransport};

/// Boxed future returned by transport operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Receiving half of a transport's inbound traffic.
pub type InboundRx = mpsc::UnboundedReceiver<Inbound>;

/// Sending half of a transport's inbound traffic.
pub(crate) type InboundTx = mpsc::UnboundedSender<Inbound>;

/// One item of inbound traffic.
#[derive(Debug)]
pub enum Inbound {
    /// A decoded JSON message.
    Message(Value),
    /// A line that failed to decode; the stream continues.
    Malformed(SdkError),
    /// A specific call can no longer complete (e.g. its HTTP response body
    /// failed mid-read). Ignored if the call already resolved.
    Failed {
        /// Identifier of the affected call.
        id: RequestId,
        /// Failure to resolve it with.
        error: SdkError,
    },
    /// A response body finished cleanly without a reply for `id`. For an
    /// ordinary call this fails it; for a streamed request it marks the end.
    Ended {
        /// Identifier of the request whose body ended.
        id: RequestId,
    },
    /// The channel is gone; no further items follow.
    Closed(SdkError),
}

impl Inbound {
    pub(crate) fn from_frame(frame: Result<Value>) -> Self {
        match frame {
            Ok(value) => Self::Message(value),
            Err(err) => Self::Malformed(err),
        }
    }
}

/// Transport variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Child process over stdin/stdout.
    Stdio,
    /// JSON-RPC over HTTP.
    Http,
}

/// Send/receive contract shared by every transport variant.
///
/// Implementations are opened once, used for any number of sends, and
/// closed exactly once; `close` is idempotent.
pub trait Transport: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> TransportKind;

    /// Establish the underlying channel and start the inbound pumps.
    ///
    /// # Errors
    ///
    /// A transport-kind-specific failure ([`SdkError::BinaryNotFound`],
    /// [`SdkError::ProcessStart`], [`SdkError::Connection`]); the transport
    /// is never left partially open.
    fn open(&self) -> BoxFuture<'_, Result<InboundRx>>;

    /// Write one message.
    ///
    /// # Errors
    ///
    /// [`SdkError::Closed`] before `open` or after `close`;
    /// [`SdkError::Process`] once the child has exited non-zero;
    /// [`SdkError::Connection`] on pipe or network failure.
    fn send(&self, message: Value) -> BoxFuture<'_, Result<()>>;

    /// Tear the channel down. Idempotent.
    ///
    /// # Errors
    ///
    /// Implementations currently always succeed; the signature leaves room
    /// for variants whose shutdown can fail.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// `true` between a successful `open` and `close`.
    fn is_open(&self) -> bool;
}

/// Build the transport selected by `config`.
#[must_use]
pub fn from_config(config: &ConduitConfig) -> Arc<dyn Transport> {
    match &config.transport {
        TransportConfig::Stdio(stdio) => Arc::new(StdioTransport::new(
            stdio.clone(),
            StdioOptions::from(config),
        )),
        TransportConfig::Http(http) => {
            Arc::new(HttpTransport::new(http.clone(), config.max_line_bytes))
        }
    }
}

/// Forward every frame to `tx`; `false` once the receiver is gone.
pub(crate) fn forward_frames<I>(tx: &InboundTx, frames: I) -> bool
where
    I: IntoIterator<Item = Result<Value>>,
{
    frames
        .into_iter()
        .all(|frame| tx.send(Inbound::from_frame(frame)).is_ok())
}
