//! Inbound/outbound message envelope.
//!
//! Two wire dialects reach the runtime: JSON-RPC 2.0 envelopes
//! (`method` / `id` / `result` / `error`) and the CLI's stream-json records
//! discriminated by a `type` field. [`Message::classify`] folds both into one
//! tagged union; payload bodies stay opaque [`Value`]s.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// `type` values that carry an `id` and expect a reply.
const TYPED_REQUESTS: &[&str] = &["elicitation_request", "resource_request"];

/// Correlation identifier: JSON-RPC allows strings or integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer identifier (allocated locally by the correlator).
    Number(i64),
    /// String identifier (typically peer-allocated).
    String(String),
}

impl RequestId {
    /// Read an identifier from a JSON value; `null` and other shapes yield `None`.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Classified message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Peer- or locally-initiated request expecting a reply.
    Request {
        /// Correlation identifier.
        id: RequestId,
        /// Method (or stream-json `type`).
        method: String,
        /// Parameters; for stream-json records the whole record.
        params: Value,
    },
    /// Successful reply.
    Response {
        /// Identifier of the request being answered.
        id: RequestId,
        /// Result payload.
        result: Value,
    },
    /// Failed reply.
    ErrorResponse {
        /// Identifier of the request being answered; `None` when the peer
        /// could not read it.
        id: Option<RequestId>,
        /// Peer-reported error.
        error: RpcError,
    },
    /// Message with no correlation identifier.
    Notification {
        /// Method (or stream-json `type`).
        method: String,
        /// Parameters; for stream-json records the whole record.
        params: Value,
    },
}

impl Message {
    /// Classify a decoded JSON value.
    ///
    /// JSON-RPC shape wins over the `type` discriminant. Values that fit
    /// neither (no `method`, no `type`, no reply fields) become a
    /// notification with an empty method so they still reach the generic
    /// notification handlers.
    #[must_use]
    pub fn classify(value: &Value) -> Self {
        let id = value.get("id").and_then(RequestId::from_value);

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            return match id {
                Some(id) => Self::Request {
                    id,
                    method: method.to_owned(),
                    params,
                },
                None => Self::Notification {
                    method: method.to_owned(),
                    params,
                },
            };
        }

        let typed = value.get("type").is_some();

        if let Some(error) = value.get("error").filter(|e| !typed && !e.is_null()) {
            let error = serde_json::from_value::<RpcError>(error.clone()).unwrap_or_else(|_| {
                RpcError {
                    code: -1,
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_owned(),
                    data: error.get("data").cloned(),
                }
            });
            return Self::ErrorResponse { id, error };
        }

        if let (false, Some(id), Some(result)) = (typed, id.clone(), value.get("result")) {
            return Self::Response {
                id,
                result: result.clone(),
            };
        }

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        match id {
            Some(id) if TYPED_REQUESTS.contains(&kind.as_str()) => Self::Request {
                id,
                method: kind,
                params: value.clone(),
            },
            _ => Self::Notification {
                method: kind,
                params: value.clone(),
            },
        }
    }

    /// Correlation identifier, if any.
    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(id),
            Self::ErrorResponse { id, .. } => id.as_ref(),
            Self::Notification { .. } => None,
        }
    }

    /// Method or stream-json discriminant, for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } | Self::ErrorResponse { .. } => None,
        }
    }

    /// `true` for replies (`Response` / `ErrorResponse`).
    #[must_use]
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Response { .. } | Self::ErrorResponse { .. })
    }
}

/// Build a JSON-RPC request envelope.
#[must_use]
pub fn request(id: &RequestId, method: &str, params: Option<Value>) -> Value {
    let mut obj = Map::new();
    obj.insert("jsonrpc".into(), json!("2.0"));
    obj.insert("id".into(), json!(id));
    obj.insert("method".into(), json!(method));
    if let Some(params) = params {
        obj.insert("params".into(), params);
    }
    Value::Object(obj)
}

/// Build a JSON-RPC notification envelope.
#[must_use]
pub fn notification(method: &str, params: Option<Value>) -> Value {
    let mut obj = Map::new();
    obj.insert("jsonrpc".into(), json!("2.0"));
    obj.insert("method".into(), json!(method));
    if let Some(params) = params {
        obj.insert("params".into(), params);
    }
    Value::Object(obj)
}

/// Build a JSON-RPC success reply.
#[must_use]
pub fn response(id: &RequestId, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Build a JSON-RPC error reply.
#[must_use]
pub fn error_response(id: &RequestId, error: &RpcError) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}
