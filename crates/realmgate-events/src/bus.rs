//! Per-realm event bus.
//!
//! Every realm owns one bus. Published events are handed to a single
//! dispatcher task which delivers them to subscribers in priority order, so
//! for any one realm subscribers observe events in publication order. A
//! broadcast tap is available for external listeners that manage their own
//! backpressure.

use crate::event::{AuthEvent, EventKind};
use crate::subscriber::Subscriber;
use parking_lot::{Mutex, RwLock};
use realmgate_core::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Dispatcher queue depth; publishers wait when it is full
    pub queue_capacity: usize,
    /// Broadcast channel capacity for external listeners
    pub broadcast_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            broadcast_capacity: 1024,
        }
    }
}

type SubscriberMap = Arc<RwLock<HashMap<EventKind, Vec<Arc<Subscriber>>>>>;

/// Ordered, realm-scoped event bus
pub struct EventBus {
    realm: String,
    tx: Mutex<Option<mpsc::Sender<Arc<AuthEvent>>>>,
    subscribers: SubscriberMap,
    broadcast_tx: broadcast::Sender<Arc<AuthEvent>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Construction spawns the dispatcher task, so a Tokio runtime must be
    /// current.
    pub fn new(realm: impl Into<String>) -> Self {
        Self::with_config(realm, EventBusConfig::default())
    }

    pub fn with_config(realm: impl Into<String>, config: EventBusConfig) -> Self {
        let realm = realm.into();
        let (tx, mut rx) = mpsc::channel::<Arc<AuthEvent>>(config.queue_capacity);
        let (broadcast_tx, _) = broadcast::channel(config.broadcast_capacity);
        let subscribers: SubscriberMap = Arc::new(RwLock::new(HashMap::new()));

        let dispatch_subscribers = subscribers.clone();
        let dispatch_broadcast = broadcast_tx.clone();
        let dispatch_realm = realm.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                Self::deliver(&dispatch_realm, &dispatch_subscribers, &event).await;
                let _ = dispatch_broadcast.send(event);
            }
            tracing::debug!(realm = %dispatch_realm, "Event dispatcher stopped");
        });

        Self {
            realm,
            tx: Mutex::new(Some(tx)),
            subscribers,
            broadcast_tx,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    async fn deliver(realm: &str, subscribers: &SubscriberMap, event: &Arc<AuthEvent>) {
        let targets: Vec<Arc<Subscriber>> = {
            let map = subscribers.read();
            map.get(&event.kind()).cloned().unwrap_or_default()
        };

        for subscriber in targets {
            if let Err(e) = subscriber.handle(event.clone()).await {
                tracing::error!(
                    realm,
                    subscriber = %subscriber.name,
                    kind = %event.kind(),
                    error = %e,
                    "Event handler failed"
                );
            }
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Subscribe to events; delivery within a kind follows priority order
    pub fn subscribe(&self, subscriber: Subscriber) {
        let subscriber = Arc::new(subscriber);
        let mut map = self.subscribers.write();
        for kind in &subscriber.config.kinds {
            let entries = map.entry(*kind).or_default();
            entries.push(subscriber.clone());
            entries.sort_by(|a, b| b.config.priority.cmp(&a.config.priority));
        }
    }

    /// Unsubscribe by subscriber name
    pub fn unsubscribe(&self, name: &str) {
        let mut map = self.subscribers.write();
        for entries in map.values_mut() {
            entries.retain(|s| s.name != name);
        }
    }

    /// Publish an event; resolves once the dispatcher has accepted it
    pub async fn publish(&self, event: AuthEvent) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or(Error::ShutdownInProgress)?;

        tracing::debug!(
            realm = %self.realm,
            kind = %event.kind(),
            event_id = %event.id,
            "Publishing event"
        );

        tx.send(Arc::new(event))
            .await
            .map_err(|_| Error::ShutdownInProgress)
    }

    pub async fn publish_all(&self, events: Vec<AuthEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }

    /// Get a broadcast receiver for external listeners
    pub fn subscribe_broadcast(&self) -> broadcast::Receiver<Arc<AuthEvent>> {
        self.broadcast_tx.subscribe()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Stop the dispatcher after draining already-accepted events
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().take();
        drop(tx);
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventData;
    use realmgate_core::error::Error;
    use realmgate_core::id::UserId;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn user_created(realm: &str) -> AuthEvent {
        AuthEvent::new(
            realm,
            EventData::UserCreated {
                user_id: UserId::new(),
                email: None,
            },
        )
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new("acme");
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        bus.subscribe(Subscriber::for_kind(EventKind::UserCreated, move |_| {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        bus.publish(user_created("acme")).await.unwrap();
        bus.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delivery_preserves_publication_order() {
        let bus = EventBus::new("acme");
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        bus.subscribe(Subscriber::for_kind(EventKind::UserCreated, move |event| {
            let seen = seen_clone.clone();
            async move {
                seen.lock().push(event.id);
                Ok(())
            }
        }));

        let mut published = Vec::new();
        for _ in 0..10 {
            let event = user_created("acme");
            published.push(event.id);
            bus.publish(event).await.unwrap();
        }
        bus.shutdown().await;

        assert_eq!(*seen.lock(), published);
    }

    #[tokio::test]
    async fn test_priority_order_within_kind() {
        let bus = EventBus::new("acme");
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for (name, priority) in [("low", 0), ("high", 10)] {
            let order = order.clone();
            bus.subscribe(Subscriber::new(
                name,
                crate::subscriber::SubscriberConfig::new(vec![EventKind::UserCreated])
                    .with_priority(priority),
                move |_| {
                    let order = order.clone();
                    let name = name.to_string();
                    async move {
                        order.lock().push(name);
                        Ok(())
                    }
                },
            ));
        }

        bus.publish(user_created("acme")).await.unwrap();
        bus.shutdown().await;

        assert_eq!(*order.lock(), vec!["high".to_string(), "low".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let bus = EventBus::new("acme");
        let counter = Arc::new(AtomicU32::new(0));

        bus.subscribe(Subscriber::new(
            "bad",
            crate::subscriber::SubscriberConfig::new(vec![EventKind::UserCreated])
                .with_priority(10),
            |_| async { Err(Error::internal("handler failure")) },
        ));
        let counter_clone = counter.clone();
        bus.subscribe(Subscriber::for_kind(EventKind::UserCreated, move |_| {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        bus.publish(user_created("acme")).await.unwrap();
        bus.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_receiver() {
        let bus = EventBus::new("acme");
        let mut receiver = bus.subscribe_broadcast();

        bus.publish(user_created("acme")).await.unwrap();

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.kind(), EventKind::UserCreated);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_fails() {
        let bus = EventBus::new("acme");
        bus.shutdown().await;

        let result = bus.publish(user_created("acme")).await;
        assert!(matches!(result, Err(Error::ShutdownInProgress)));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new("acme");
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        bus.subscribe(Subscriber::new(
            "counting",
            crate::subscriber::SubscriberConfig::new(vec![EventKind::UserCreated]),
            move |_| {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));

        let mut tap = bus.subscribe_broadcast();
        bus.publish(user_created("acme")).await.unwrap();
        // The broadcast tap fires after subscriber delivery, so the first
        // event is fully dispatched before we unsubscribe.
        tap.recv().await.unwrap();

        bus.unsubscribe("counting");
        bus.publish(user_created("acme")).await.unwrap();
        bus.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
