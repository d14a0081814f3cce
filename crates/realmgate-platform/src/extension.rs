//! Extension model.
//!
//! An extension is a host-supplied component that attaches to a realm: it
//! registers lifecycle hooks, subscribes to events, and may publish services
//! into the realm's service table. Everything it registers is tagged with its
//! id so detaching removes it cleanly.

use async_trait::async_trait;
use realmgate_core::error::Result;
use realmgate_core::hook::HookRegistry;
use realmgate_core::service::ServiceTable;
use realmgate_events::EventBus;
use std::sync::Arc;

/// What an extension can reach while attached
#[derive(Clone)]
pub struct RealmHandle {
    pub realm: String,
    pub hooks: Arc<HookRegistry>,
    pub bus: Arc<EventBus>,
    pub services: Arc<ServiceTable>,
}

/// A pluggable realm extension
#[async_trait]
pub trait Extension: Send + Sync {
    /// Stable identifier; used to tag and later remove registrations
    fn id(&self) -> &str;

    /// Register hooks, subscribers and services
    async fn attach(&self, realm: &RealmHandle) -> Result<()>;

    /// Undo anything `attach` did beyond tagged hook registrations
    async fn detach(&self, _realm: &RealmHandle) -> Result<()> {
        Ok(())
    }
}
