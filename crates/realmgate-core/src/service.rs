//! Realm-scoped service lookup.
//!
//! Extensions and engines publish themselves into the table at realm
//! construction; consumers resolve them by type without global state.

use async_trait::async_trait;
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::error::Result;

/// Lifecycle contract for long-running components owned by a realm
#[async_trait]
pub trait Service: Send + Sync {
    /// Service name for logging and identification
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Type-indexed service table, keyed per realm
pub struct ServiceTable {
    entries: DashMap<(String, TypeId), Arc<dyn Any + Send + Sync>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Publish a service instance for a realm
    pub fn insert<T: Send + Sync + 'static>(&self, realm: &str, service: Arc<T>) {
        self.entries
            .insert((realm.to_string(), TypeId::of::<T>()), service);
    }

    /// Resolve a service instance for a realm
    pub fn get<T: Send + Sync + 'static>(&self, realm: &str) -> Option<Arc<T>> {
        self.entries
            .get(&(realm.to_string(), TypeId::of::<T>()))
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    /// Drop every service registered for a realm
    pub fn remove_realm(&self, realm: &str) {
        self.entries.retain(|(r, _), _| r != realm);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ServiceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(u32);

    #[test]
    fn test_insert_and_get() {
        let table = ServiceTable::new();
        table.insert("acme", Arc::new(Dummy(7)));

        let found: Arc<Dummy> = table.get("acme").unwrap();
        assert_eq!(found.0, 7);
    }

    #[test]
    fn test_realm_isolation() {
        let table = ServiceTable::new();
        table.insert("acme", Arc::new(Dummy(1)));

        assert!(table.get::<Dummy>("other").is_none());
    }

    #[test]
    fn test_remove_realm() {
        let table = ServiceTable::new();
        table.insert("acme", Arc::new(Dummy(1)));
        table.insert("other", Arc::new(Dummy(2)));

        table.remove_realm("acme");
        assert!(table.get::<Dummy>("acme").is_none());
        assert!(table.get::<Dummy>("other").is_some());
    }
}
