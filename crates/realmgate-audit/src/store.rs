//! Audit storage contract and in-memory implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use realmgate_core::error::Result;
use realmgate_core::id::AuditId;

use crate::event::{AuditEvent, AuditFilter};

/// Storage contract for audit rows. The batch insert is the pipeline's one
/// write path and must be transactional.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Insert a batch atomically; either every row lands or none do
    async fn insert_batch(&self, events: &[AuditEvent]) -> Result<()>;

    /// Filtered query, newest first, with limit/offset
    async fn query(
        &self,
        filter: &AuditFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AuditEvent>>;

    async fn count(&self, filter: &AuditFilter) -> Result<u64>;

    async fn get(&self, id: AuditId) -> Result<Option<AuditEvent>>;

    /// Delete rows with `timestamp < cutoff` (strict, a row exactly at the
    /// cutoff survives); returns the count
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// In-memory audit store
pub struct InMemoryAuditStore {
    events: RwLock<Vec<AuditEvent>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn insert_batch(&self, events: &[AuditEvent]) -> Result<()> {
        self.events.write().extend_from_slice(events);
        Ok(())
    }

    async fn query(
        &self,
        filter: &AuditFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AuditEvent>> {
        let events = self.events.read();
        let mut matched: Vec<AuditEvent> = events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self, filter: &AuditFilter) -> Result<u64> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| filter.matches(e))
            .count() as u64)
    }

    async fn get(&self, id: AuditId) -> Result<Option<AuditEvent>> {
        Ok(self.events.read().iter().find(|e| e.id == id).cloned())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| e.timestamp >= cutoff);
        Ok((before - events.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ActorType, AuditResult};

    fn event(event_type: &str, at: DateTime<Utc>) -> AuditEvent {
        AuditEvent::new("acme", event_type, ActorType::User, AuditResult::Success).at(at)
    }

    #[tokio::test]
    async fn test_query_orders_descending() {
        let store = InMemoryAuditStore::new();
        let t0 = Utc::now();

        store
            .insert_batch(&[
                event("a", t0),
                event("b", t0 + chrono::Duration::seconds(1)),
                event("c", t0 + chrono::Duration::seconds(2)),
            ])
            .await
            .unwrap();

        let rows = store.query(&AuditFilter::default(), 10, 0).await.unwrap();
        let types: Vec<&str> = rows.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["c", "b", "a"]);

        let paged = store.query(&AuditFilter::default(), 1, 1).await.unwrap();
        assert_eq!(paged[0].event_type, "b");
    }

    #[tokio::test]
    async fn test_retention_boundary_is_strict() {
        let store = InMemoryAuditStore::new();
        let cutoff = Utc::now();

        store
            .insert_batch(&[
                event("old", cutoff - chrono::Duration::seconds(1)),
                event("boundary", cutoff),
                event("new", cutoff + chrono::Duration::seconds(1)),
            ])
            .await
            .unwrap();

        let deleted = store.delete_before(cutoff).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.query(&AuditFilter::default(), 10, 0).await.unwrap();
        let types: Vec<&str> = remaining.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"boundary"));
        assert!(types.contains(&"new"));
        assert!(!types.contains(&"old"));
    }

    #[tokio::test]
    async fn test_count_respects_filter() {
        let store = InMemoryAuditStore::new();
        let t0 = Utc::now();
        store
            .insert_batch(&[event("a", t0), event("a", t0), event("b", t0)])
            .await
            .unwrap();

        let filter = AuditFilter {
            event_types: Some(vec!["a".to_string()]),
            ..Default::default()
        };
        assert_eq!(store.count(&filter).await.unwrap(), 2);
    }
}
