//! Peer-initiated events.
//!
//! Anything the peer sends that is neither a reply to one of our calls nor a
//! conversation turn is an event. Events are sorted into four categories by
//! their method or `type` discriminant and delivered to the handlers
//! registered for that category by the [`EventDispatcher`].

pub mod dispatcher;
pub mod handlers;

use serde_json::Value;

use crate::protocol::{Message, RequestId};

pub use dispatcher::EventDispatcher;
pub use handlers::EventHandlerSet;

/// Handler category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    /// Anything not covered by a more specific category.
    Notification,
    /// The peer asks the user a question and waits for the answer.
    Elicitation,
    /// The peer's tool list changed.
    ToolsChanged,
    /// The peer asks the host for a resource and waits for its content.
    ResourceRequest,
}

impl EventCategory {
    /// Category for a method or `type` discriminant.
    #[must_use]
    pub fn of(method: &str) -> Self {
        match method {
            "elicitation_request" | "elicitation/create" | "elicitation/request" => {
                Self::Elicitation
            }
            "tools_changed" | "notifications/tools/list_changed" => Self::ToolsChanged,
            "resource_request" | "resources/read" => Self::ResourceRequest,
            _ => Self::Notification,
        }
    }

    /// `true` for categories whose handlers produce a reply.
    #[must_use]
    pub fn expects_reply(self) -> bool {
        matches!(self, Self::Elicitation | Self::ResourceRequest)
    }
}

/// A classified, already-decoded event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Handler category.
    pub category: EventCategory,
    /// Method or `type` discriminant; empty when the payload had neither.
    pub method: String,
    /// Identifier to answer under, for peer-initiated requests.
    pub id: Option<RequestId>,
    /// Structured parameters.
    pub params: Value,
    /// Payload exactly as received.
    pub raw: Value,
}

impl Event {
    /// Build an event from a classified unsolicited message.
    ///
    /// Returns `None` for replies, which are never events.
    #[must_use]
    pub fn from_message(message: Message, raw: Value) -> Option<Self> {
        let (id, method, params) = match message {
            Message::Request { id, method, params } => (Some(id), method, params),
            Message::Notification { method, params } => (None, method, params),
            Message::Response { .. } | Message::ErrorResponse { .. } => return None,
        };
        Some(Self {
            category: EventCategory::of(&method),
            method,
            id,
            params,
            raw,
        })
    }
}

/// Generic notification.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    /// Method or `type` discriminant.
    pub method: String,
    /// Structured parameters.
    pub params: Value,
    /// Payload exactly as received.
    pub raw: Value,
}

/// Question the peer wants answered.
#[derive(Debug, Clone, PartialEq)]
pub struct ElicitationRequest {
    /// Identifier the answer is sent under.
    pub id: Option<RequestId>,
    /// Question text (`prompt` or `message` parameter); empty if absent.
    pub prompt: String,
    /// Structured parameters.
    pub params: Value,
    /// Payload exactly as received.
    pub raw: Value,
}

/// Change in the peer's tool list.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolsChanged {
    /// Tools that appeared.
    pub added_tools: Vec<String>,
    /// Tools that went away.
    pub removed_tools: Vec<String>,
    /// Structured parameters.
    pub params: Value,
    /// Payload exactly as received.
    pub raw: Value,
}

/// Resource the peer wants read.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequest {
    /// Identifier the content is sent under.
    pub id: Option<RequestId>,
    /// Resource name (`name` or `uri` parameter); empty if absent.
    pub name: String,
    /// Structured parameters.
    pub params: Value,
    /// Payload exactly as received.
    pub raw: Value,
}

impl From<&Event> for NotificationEvent {
    fn from(event: &Event) -> Self {
        Self {
            method: event.method.clone(),
            params: event.params.clone(),
            raw: event.raw.clone(),
        }
    }
}

impl From<&Event> for ElicitationRequest {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id.clone(),
            prompt: first_str(&event.params, &["prompt", "message"]),
            params: event.params.clone(),
            raw: event.raw.clone(),
        }
    }
}

impl From<&Event> for ToolsChanged {
    fn from(event: &Event) -> Self {
        Self {
            added_tools: str_list(&event.params, "added_tools"),
            removed_tools: str_list(&event.params, "removed_tools"),
            params: event.params.clone(),
            raw: event.raw.clone(),
        }
    }
}

impl From<&Event> for ResourceRequest {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id.clone(),
            name: first_str(&event.params, &["name", "uri"]),
            params: event.params.clone(),
            raw: event.raw.clone(),
        }
    }
}

fn first_str(params: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| params.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
        .to_owned()
}

fn str_list(params: &Value, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}
