//! The audit pipeline.
//!
//! Shape: enqueue → bounded queue → background batcher → transactional batch
//! insert. Enqueue never blocks and never propagates failure to the caller;
//! a full queue drops the event with an error log. The batcher flushes when
//! a batch fills or the flush interval elapses, logs and discards failed
//! batches, and drains what is left when the pipeline shuts down.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use realmgate_core::clock::SharedClock;
use realmgate_core::config::AuditConfig;
use realmgate_core::error::Result;
use realmgate_core::id::AuditId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event::{AuditEvent, AuditFilter};
use crate::export::{export, ExportFormat};
use crate::sanitize::sanitize_metadata;
use crate::store::AuditStore;

/// Audit pipeline for one realm
pub struct AuditPipeline<S: AuditStore + ?Sized> {
    config: AuditConfig,
    store: Arc<S>,
    clock: SharedClock,
    tx: Mutex<Option<mpsc::Sender<AuditEvent>>>,
    batcher: Mutex<Option<JoinHandle<()>>>,
}

impl<S: AuditStore + ?Sized + 'static> AuditPipeline<S> {
    pub fn new(config: AuditConfig, store: Arc<S>, clock: SharedClock) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let batcher = Self::spawn_batcher(
            rx,
            store.clone(),
            config.batch_size.max(1),
            config
                .flush_interval
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(5)),
        );

        Self {
            config,
            store,
            clock,
            tx: Mutex::new(Some(tx)),
            batcher: Mutex::new(Some(batcher)),
        }
    }

    fn spawn_batcher(
        mut rx: mpsc::Receiver<AuditEvent>,
        store: Arc<S>,
        batch_size: usize,
        flush_interval: std::time::Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                // Block for the batch's first event; None means shutdown and
                // the buffer is already drained.
                let first = match rx.recv().await {
                    Some(event) => event,
                    None => break,
                };

                let mut batch = Vec::with_capacity(batch_size);
                batch.push(first);

                let deadline = tokio::time::sleep(flush_interval);
                tokio::pin!(deadline);

                let mut closed = false;
                while batch.len() < batch_size {
                    tokio::select! {
                        _ = &mut deadline => break,
                        received = rx.recv() => match received {
                            Some(event) => batch.push(event),
                            None => {
                                closed = true;
                                break;
                            }
                        },
                    }
                }

                if let Err(e) = store.insert_batch(&batch).await {
                    // The failed batch is discarded; the pipeline continues.
                    tracing::error!(
                        batch_len = batch.len(),
                        error = %e,
                        "Audit batch insert failed; batch dropped"
                    );
                }

                if closed {
                    break;
                }
            }
            tracing::debug!("Audit batcher stopped");
        })
    }

    /// Non-blocking enqueue. Disabled pipelines and full queues drop the
    /// event; neither surfaces to the caller.
    pub fn enqueue(&self, mut event: AuditEvent) {
        if !self.config.enabled {
            return;
        }

        event.metadata = sanitize_metadata(std::mem::take(&mut event.metadata));

        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            tracing::error!("Audit pipeline already shut down; event dropped");
            return;
        };

        if let Err(e) = tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::error!("Audit queue full; event dropped");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::error!("Audit queue closed; event dropped");
                }
            }
        }
    }

    /// Filtered query, newest first
    pub async fn query(
        &self,
        filter: &AuditFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AuditEvent>> {
        self.store.query(filter, limit, offset).await
    }

    pub async fn count(&self, filter: &AuditFilter) -> Result<u64> {
        self.store.count(filter).await
    }

    pub async fn get(&self, id: AuditId) -> Result<Option<AuditEvent>> {
        self.store.get(id).await
    }

    /// Export matching rows as pretty JSON or CSV
    pub async fn export(&self, filter: &AuditFilter, format: ExportFormat) -> Result<String> {
        let rows = self.store.query(filter, usize::MAX, 0).await?;
        export(&rows, format)
    }

    /// Delete rows strictly older than the cutoff
    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.store.delete_before(cutoff).await
    }

    /// Retention pass using the configured period
    pub async fn cleanup_old_audit_logs(&self) -> Result<u64> {
        let cutoff = self.clock.now() - self.config.retention_period;
        let deleted = self.cleanup_older_than(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, "Pruned audit rows past retention");
        }
        Ok(deleted)
    }

    /// Stop accepting events and wait for the batcher to drain what remains
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().take();
        drop(tx);
        let handle = self.batcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ActorType, AuditResult};
    use crate::store::InMemoryAuditStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use realmgate_core::clock::{system_clock, Clock, FixedClock};
    use realmgate_core::error::Error;
    use serde_json::json;

    fn pipeline(config: AuditConfig) -> AuditPipeline<InMemoryAuditStore> {
        AuditPipeline::new(config, Arc::new(InMemoryAuditStore::new()), system_clock())
    }

    fn login_event() -> AuditEvent {
        AuditEvent::new("acme", "login.success", ActorType::User, AuditResult::Success)
    }

    #[tokio::test]
    async fn test_enqueue_flush_on_shutdown() {
        let pipeline = pipeline(AuditConfig::default());

        for _ in 0..7 {
            pipeline.enqueue(login_event());
        }
        pipeline.shutdown().await;

        assert_eq!(pipeline.count(&AuditFilter::default()).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_batch_fills_trigger_flush() {
        let pipeline = pipeline(AuditConfig {
            batch_size: 3,
            flush_interval: Duration::seconds(60),
            ..Default::default()
        });

        for _ in 0..3 {
            pipeline.enqueue(login_event());
        }

        // A full batch flushes well before the 60s interval.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(pipeline.count(&AuditFilter::default()).await.unwrap(), 3);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_metadata_sanitized_on_write() {
        let pipeline = pipeline(AuditConfig::default());

        pipeline.enqueue(
            login_event()
                .with_metadata("password", "p")
                .with_metadata("userAgent", "<script>x</script>"),
        );
        pipeline.shutdown().await;

        let rows = pipeline.query(&AuditFilter::default(), 10, 0).await.unwrap();
        assert_eq!(rows[0].metadata["password"], json!("[REDACTED]"));
        assert_eq!(
            rows[0].metadata["userAgent"],
            json!("&lt;script&gt;x&lt;&#x2F;script&gt;")
        );
    }

    #[tokio::test]
    async fn test_disabled_pipeline_drops_everything() {
        let pipeline = pipeline(AuditConfig {
            enabled: false,
            ..Default::default()
        });
        pipeline.enqueue(login_event());
        pipeline.shutdown().await;
        assert_eq!(pipeline.count(&AuditFilter::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_error() {
        let pipeline = pipeline(AuditConfig {
            queue_capacity: 1,
            batch_size: 100,
            flush_interval: Duration::seconds(60),
            ..Default::default()
        });

        // Far more events than capacity; enqueue never blocks or fails.
        for _ in 0..100 {
            pipeline.enqueue(login_event());
        }
        pipeline.shutdown().await;

        let stored = pipeline.count(&AuditFilter::default()).await.unwrap();
        assert!(stored < 100);
    }

    #[tokio::test]
    async fn test_retention_uses_clock() {
        let clock = FixedClock::for_tests();
        let store = Arc::new(InMemoryAuditStore::new());
        let pipeline = AuditPipeline::new(
            AuditConfig {
                retention_period: Duration::days(30),
                ..Default::default()
            },
            store.clone(),
            Arc::new(clock.clone()),
        );

        pipeline.enqueue(login_event().at(clock.now() - Duration::days(31)));
        pipeline.enqueue(login_event().at(clock.now() - Duration::days(30)));
        pipeline.enqueue(login_event().at(clock.now()));

        // Shutdown drains the queue so all three rows are at rest.
        pipeline.shutdown().await;

        let deleted = pipeline.cleanup_old_audit_logs().await.unwrap();
        assert_eq!(deleted, 1);
        // The row exactly at the cutoff survives.
        assert_eq!(pipeline.count(&AuditFilter::default()).await.unwrap(), 2);
    }

    /// Store that fails its first insert
    struct FlakyStore {
        inner: InMemoryAuditStore,
        failed_once: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl AuditStore for FlakyStore {
        async fn insert_batch(&self, events: &[AuditEvent]) -> Result<()> {
            if !self.failed_once.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::database("insert failed"));
            }
            self.inner.insert_batch(events).await
        }

        async fn query(
            &self,
            filter: &AuditFilter,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<AuditEvent>> {
            self.inner.query(filter, limit, offset).await
        }

        async fn count(&self, filter: &AuditFilter) -> Result<u64> {
            self.inner.count(filter).await
        }

        async fn get(&self, id: AuditId) -> Result<Option<AuditEvent>> {
            self.inner.get(id).await
        }

        async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
            self.inner.delete_before(cutoff).await
        }
    }

    #[tokio::test]
    async fn test_failed_batch_is_discarded_and_pipeline_continues() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryAuditStore::new(),
            failed_once: std::sync::atomic::AtomicBool::new(false),
        });
        let pipeline = AuditPipeline::new(
            AuditConfig {
                batch_size: 1,
                flush_interval: Duration::milliseconds(10),
                ..Default::default()
            },
            store,
            system_clock(),
        );

        pipeline.enqueue(login_event());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        pipeline.enqueue(login_event());
        pipeline.shutdown().await;

        // First batch was dropped, second landed.
        assert_eq!(pipeline.count(&AuditFilter::default()).await.unwrap(), 1);
    }
}
