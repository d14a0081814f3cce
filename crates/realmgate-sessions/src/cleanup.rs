//! Background session cleanup.
//!
//! One cooperative task per realm runs `cleanup_pass` at the configured
//! interval. Shutdown is a watch-channel signal; the task exits at the next
//! opportunity without taking down anything else with it.

use realmgate_core::error::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::SessionEngine;
use crate::session::SessionStore;

/// Handle to a running cleanup loop
pub struct CleanupTask {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl CleanupTask {
    /// Spawn the loop; the first pass runs after one interval
    pub fn spawn<S: SessionStore + ?Sized + 'static>(
        engine: Arc<SessionEngine<S>>,
        interval: std::time::Duration,
    ) -> Self {
        let (shutdown, mut rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval fires immediately once; swallow that tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.cleanup_pass().await {
                            tracing::error!(error = %e, "Session cleanup pass failed");
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Session cleanup task stopped");
        });

        Self { handle, shutdown }
    }

    /// Signal the loop to stop and wait for it
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionStore;
    use realmgate_core::clock::system_clock;
    use realmgate_core::config::SessionConfig;
    use realmgate_events::EventBus;

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let bus = Arc::new(EventBus::new("acme"));
        let engine = Arc::new(SessionEngine::new(
            "acme",
            SessionConfig::default(),
            Arc::new(InMemorySessionStore::new()),
            system_clock(),
            bus.clone(),
        ));

        let task = CleanupTask::spawn(engine, std::time::Duration::from_millis(10));
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        task.shutdown().await.unwrap();
        bus.shutdown().await;
    }
}
