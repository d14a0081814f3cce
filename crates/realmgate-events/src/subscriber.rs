//! Event subscribers and handlers.

use crate::event::{AuthEvent, EventKind};
use realmgate_core::error::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Event handler function type
pub type HandlerFn =
    Arc<dyn Fn(Arc<AuthEvent>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Subscriber configuration
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Event kinds to subscribe to
    pub kinds: Vec<EventKind>,
    /// Priority (higher = earlier delivery within a kind)
    pub priority: i32,
}

impl SubscriberConfig {
    pub fn new(kinds: Vec<EventKind>) -> Self {
        Self { kinds, priority: 0 }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Event subscriber
pub struct Subscriber {
    pub name: String,
    pub config: SubscriberConfig,
    pub handler: HandlerFn,
}

impl Subscriber {
    pub fn new<F, Fut>(name: impl Into<String>, config: SubscriberConfig, handler: F) -> Self
    where
        F: Fn(Arc<AuthEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            config,
            handler: Arc::new(move |event| Box::pin(handler(event))),
        }
    }

    pub fn for_kind<F, Fut>(kind: EventKind, handler: F) -> Self
    where
        F: Fn(Arc<AuthEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = format!("subscriber_{}", kind.as_str());
        Self::new(name, SubscriberConfig::new(vec![kind]), handler)
    }

    pub fn for_kinds<F, Fut>(kinds: Vec<EventKind>, handler: F) -> Self
    where
        F: Fn(Arc<AuthEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = format!("subscriber_multi_{}", kinds.len());
        Self::new(name, SubscriberConfig::new(kinds), handler)
    }

    pub async fn handle(&self, event: Arc<AuthEvent>) -> Result<()> {
        (self.handler)(event).await
    }

    pub fn handles(&self, kind: EventKind) -> bool {
        self.config.kinds.contains(&kind)
    }
}
