//! JSON-RPC over HTTP.
//!
//! Every `send` is one POST to the RPC endpoint; the response body is framed
//! and forwarded inbound by a task tracked for the lifetime of the transport,
//! so a streamed body (several concatenated or newline-delimited documents)
//! is handled the same way as stdout of a child.
//!
//! Server-initiated events arrive on a long-lived GET against the event
//! endpoint. The channel is optional: a `404`/`405` at `open` means the
//! service has none. Once established, a dropped channel is re-established
//! per [`ReconnectPolicy`]; when retries run out the inbound stream closes
//! with a connection error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{HttpConfig, ReconnectPolicy};
use crate::protocol::{Framer, Message, RequestId};
use crate::transport::{
    forward_frames, BoxFuture, Inbound, InboundRx, InboundTx, Transport, TransportKind,
};
use crate::{Result, SdkError};

const NDJSON: &str = "application/x-ndjson";

struct Session {
    client: Client,
    tx: InboundTx,
}

/// Transport speaking JSON-RPC to a remote service.
pub struct HttpTransport {
    config: HttpConfig,
    max_line_bytes: usize,
    session: Mutex<Option<Session>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    opened: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.config.base_url)
            .field("opened", &self.opened.load(Ordering::Acquire))
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Create an unopened transport for `config`.
    #[must_use]
    pub fn new(config: HttpConfig, max_line_bytes: usize) -> Self {
        Self {
            config,
            max_line_bytes,
            session: Mutex::new(None),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> Option<(Client, InboundTx)> {
        self.lock_session()
            .as_ref()
            .map(|session| (session.client.clone(), session.tx.clone()))
    }

    async fn open_inner(&self) -> Result<InboundRx> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SdkError::Closed);
        }
        if self.opened.swap(true, Ordering::AcqRel) {
            return Err(SdkError::Sdk("http transport already opened".into()));
        }

        let result = self.connect().await;
        if result.is_err() {
            self.opened.store(false, Ordering::Release);
        }
        result
    }

    async fn connect(&self) -> Result<InboundRx> {
        let client = build_client(&self.config)?;
        let events_url = self.config.events_url();
        let (tx, rx) = mpsc::unbounded_channel();

        match connect_events(&client, &events_url).await? {
            Some(response) => {
                self.tasks.spawn(pump_events(
                    client.clone(),
                    events_url,
                    response,
                    self.config.reconnect,
                    tx.clone(),
                    self.cancel.clone(),
                    self.max_line_bytes,
                ));
            }
            None => {
                warn!(url = %events_url, "http transport: service has no event channel");
            }
        }

        *self.lock_session() = Some(Session { client, tx });
        info!(base_url = %self.config.base_url, "http transport: opened");
        Ok(rx)
    }

    async fn send_inner(&self, message: Value) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SdkError::Closed);
        }
        let (client, tx) = self.session().ok_or(SdkError::Closed)?;
        let awaited = match Message::classify(&message) {
            Message::Request { id, .. } => Some(id),
            _ => None,
        };

        let mut request = client
            .post(self.config.rpc_url())
            .header(ACCEPT, "application/json")
            .json(&message);
        if let Some(timeout) = self.config.timeout() {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(SdkError::from)?;
        let status = response.status();

        if !status.is_success() {
            // Some services carry a JSON-RPC error object on a 4xx/5xx body.
            let body = response.bytes().await.unwrap_or_default();
            let mut framer = Framer::with_max_line_bytes("http:response", self.max_line_bytes);
            let mut frames: Vec<_> = framer.feed(&body).collect();
            frames.extend(framer.finish());
            let has_rpc_error = frames.iter().any(|frame| {
                matches!(frame, Ok(value)
                    if matches!(Message::classify(value), Message::ErrorResponse { id: Some(_), .. }))
            });
            if has_rpc_error {
                debug!(%status, "http transport: error status carries a JSON-RPC error");
                forward_frames(&tx, frames);
                return Ok(());
            }
            warn!(%status, "http transport: request rejected");
            return Err(SdkError::Connection(format!("http status {status}")));
        }

        let framer = Framer::with_max_line_bytes("http:response", self.max_line_bytes);
        self.tasks.spawn(pump_body(
            response,
            framer,
            tx,
            awaited,
            self.cancel.clone(),
        ));
        Ok(())
    }

    async fn close_inner(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.lock_session().take();
        info!(base_url = %self.config.base_url, "http transport: closed");
        Ok(())
    }
}

impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn open(&self) -> BoxFuture<'_, Result<InboundRx>> {
        Box::pin(self.open_inner())
    }

    fn send(&self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.send_inner(message))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.close_inner())
    }

    fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }
}

fn build_client(config: &HttpConfig) -> Result<Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| SdkError::Config(format!("invalid header name {name:?}: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| SdkError::Config(format!("invalid value for header {name}: {err}")))?;
        headers.insert(name, value);
    }

    Client::builder()
        .default_headers(headers)
        .build()
        .map_err(|err| SdkError::Sdk(format!("failed to build http client: {err}")))
}

/// Open the event channel; `Ok(None)` when the service does not offer one.
async fn connect_events(client: &Client, url: &str) -> Result<Option<Response>> {
    let response = client
        .get(url)
        .header(ACCEPT, NDJSON)
        .send()
        .await
        .map_err(SdkError::from)?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND || status == StatusCode::METHOD_NOT_ALLOWED {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(SdkError::Connection(format!(
            "event channel: http status {status}"
        )));
    }
    Ok(Some(response))
}

/// Drain one response body into the inbound stream.
///
/// Once the body ends or fails, the awaited request is reported as
/// [`Inbound::Ended`] or [`Inbound::Failed`] so a call left without a reply
/// fails immediately instead of waiting out its timeout.
async fn pump_body(
    response: Response,
    mut framer: Framer,
    tx: InboundTx,
    awaited: Option<RequestId>,
    cancel: CancellationToken,
) {
    let mut body = response.bytes_stream();
    let failure = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(discarded = framer.buffered(), "http transport: response body abandoned on close");
                framer.reset();
                return;
            }
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    if !forward_frames(&tx, framer.feed(&bytes)) {
                        return;
                    }
                }
                Some(Err(err)) => {
                    warn!(%err, "http transport: response body failed");
                    break Some(SdkError::Connection(format!("http response body failed: {err}")));
                }
                None => {
                    forward_frames(&tx, framer.finish());
                    break None;
                }
            }
        }
    };

    if let Some(id) = awaited {
        let _ = tx.send(match failure {
            Some(error) => Inbound::Failed { id, error },
            None => Inbound::Ended { id },
        });
    }
}

async fn pump_events(
    client: Client,
    url: String,
    first: Response,
    policy: ReconnectPolicy,
    tx: InboundTx,
    cancel: CancellationToken,
    max_line_bytes: usize,
) {
    let mut current = Some(first);
    let mut failures: u32 = 0;

    loop {
        let response = match current.take() {
            Some(response) => response,
            None => {
                if failures >= policy.max_retries {
                    warn!(url = %url, retries = failures, "event channel: giving up");
                    let _ = tx.send(Inbound::Closed(SdkError::Connection(format!(
                        "event channel lost after {failures} reconnect attempts"
                    ))));
                    return;
                }
                failures += 1;
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(policy.backoff()) => {}
                }
                match connect_events(&client, &url).await {
                    Ok(Some(response)) => {
                        info!(url = %url, attempt = failures, "event channel: reconnected");
                        response
                    }
                    Ok(None) => {
                        warn!(url = %url, attempt = failures, "event channel: endpoint disappeared");
                        continue;
                    }
                    Err(err) => {
                        warn!(url = %url, attempt = failures, error = %err, "event channel: reconnect failed");
                        continue;
                    }
                }
            }
        };

        let mut framer = Framer::with_max_line_bytes("http:events", max_line_bytes);
        let mut body = response.bytes_stream();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(url = %url, discarded = framer.buffered(), "event channel: closed");
                    framer.reset();
                    return;
                }
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        failures = 0;
                        if !forward_frames(&tx, framer.feed(&bytes)) {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(url = %url, %err, "event channel: stream failed");
                        break;
                    }
                    None => {
                        forward_frames(&tx, framer.finish());
                        debug!(url = %url, "event channel: stream ended");
                        break;
                    }
                }
            }
        }
    }
}
