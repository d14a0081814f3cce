//! # Realmgate Events
//!
//! Typed auth events and the per-realm ordered event bus. One bus per realm;
//! a single dispatcher task delivers events to subscribers in publication
//! order, with a broadcast tap for external listeners.

pub mod bus;
pub mod event;
pub mod subscriber;

pub use bus::{EventBus, EventBusConfig};
pub use event::{AnomalyKind, AuthEvent, EventData, EventKind};
pub use subscriber::{Subscriber, SubscriberConfig};
