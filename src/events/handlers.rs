//! Handler registration table.
//!
//! Handlers are plain async closures, registered per category before the
//! connection opens. Notification-style handlers return `Result<()>`;
//! request-style handlers (elicitation, resource) return the reply text.

use std::future::Future;
use std::sync::Arc;

use crate::events::{
    ElicitationRequest, EventCategory, NotificationEvent, ResourceRequest, ToolsChanged,
};
use crate::transport::BoxFuture;
use crate::Result;

/// Handler that only observes an event.
pub type ObserveFn<E> = Arc<dyn Fn(E) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handler that answers an event with reply text.
pub type ReplyFn<E> = Arc<dyn Fn(E) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Category → handlers mapping.
#[derive(Clone, Default)]
pub struct EventHandlerSet {
    pub(crate) notification: Vec<ObserveFn<NotificationEvent>>,
    pub(crate) elicitation: Vec<ReplyFn<ElicitationRequest>>,
    pub(crate) tools_changed: Vec<ObserveFn<ToolsChanged>>,
    pub(crate) resource_request: Vec<ReplyFn<ResourceRequest>>,
}

impl std::fmt::Debug for EventHandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlerSet")
            .field("notification", &self.notification.len())
            .field("elicitation", &self.elicitation.len())
            .field("tools_changed", &self.tools_changed.len())
            .field("resource_request", &self.resource_request.len())
            .finish()
    }
}

impl EventHandlerSet {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for generic notifications.
    #[must_use]
    pub fn on_notification<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(NotificationEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.notification.push(observe(handler));
        self
    }

    /// Register a handler for elicitation requests.
    #[must_use]
    pub fn on_elicitation_request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ElicitationRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        self.elicitation.push(reply(handler));
        self
    }

    /// Register a handler for tool-list changes.
    #[must_use]
    pub fn on_tools_changed<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ToolsChanged) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.tools_changed.push(observe(handler));
        self
    }

    /// Register a handler for resource requests.
    #[must_use]
    pub fn on_resource_request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ResourceRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        self.resource_request.push(reply(handler));
        self
    }

    /// Number of handlers registered for `category`.
    #[must_use]
    pub fn count(&self, category: EventCategory) -> usize {
        match category {
            EventCategory::Notification => self.notification.len(),
            EventCategory::Elicitation => self.elicitation.len(),
            EventCategory::ToolsChanged => self.tools_changed.len(),
            EventCategory::ResourceRequest => self.resource_request.len(),
        }
    }

    /// `true` when no handler is registered at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notification.is_empty()
            && self.elicitation.is_empty()
            && self.tools_changed.is_empty()
            && self.resource_request.is_empty()
    }
}

fn observe<E, F, Fut>(handler: F) -> ObserveFn<E>
where
    E: 'static,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event: E| -> BoxFuture<'static, Result<()>> { Box::pin(handler(event)) })
}

fn reply<E, F, Fut>(handler: F) -> ReplyFn<E>
where
    E: 'static,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    Arc::new(move |event: E| -> BoxFuture<'static, Result<String>> { Box::pin(handler(event)) })
}
