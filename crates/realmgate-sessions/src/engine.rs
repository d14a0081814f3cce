//! Session engine.
//!
//! Sessions are created as a consequence of `TokenIssued` events rather than
//! by direct calls on the auth path: the engine subscribes to the realm's bus
//! and owns one session per active token family. Refreshes slide the expiry;
//! logout and admin revocation terminate; a background pass archives.

use chrono::{DateTime, Utc};
use realmgate_core::clock::SharedClock;
use realmgate_core::config::SessionConfig;
use realmgate_core::device;
use realmgate_core::error::Result;
use realmgate_core::id::{SessionId, TokenFamily, UserId};
use realmgate_events::{
    AuthEvent, EventBus, EventData, EventKind, Subscriber, SubscriberConfig,
};
use std::sync::Arc;

use crate::anomaly::{AnomalyDetector, PriorFootprint};
use crate::session::{Session, SessionHistoryEntry, SessionStatus, SessionStore};

/// Revocation reason written when the concurrency cap evicts a session
pub const REASON_MAX_SESSIONS: &str = "max_sessions_exceeded";

/// Counters from one cleanup pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub expired: u64,
    pub archived: u64,
    pub pruned_history: u64,
}

/// Session engine for one realm
pub struct SessionEngine<S: SessionStore + ?Sized> {
    realm: String,
    config: SessionConfig,
    store: Arc<S>,
    detector: AnomalyDetector,
    clock: SharedClock,
    bus: Arc<EventBus>,
}

impl<S: SessionStore + ?Sized + 'static> SessionEngine<S> {
    pub fn new(
        realm: impl Into<String>,
        config: SessionConfig,
        store: Arc<S>,
        clock: SharedClock,
        bus: Arc<EventBus>,
    ) -> Self {
        let detector = AnomalyDetector::new(config.anomaly_detection.clone());
        Self {
            realm: realm.into(),
            config,
            store,
            detector,
            clock,
            bus,
        }
    }

    /// Subscribe to the realm's token events. Priority is above default so
    /// session rows exist before lower-priority mirrors observe the event.
    pub fn register_subscribers(self: &Arc<Self>, bus: &EventBus) {
        let engine = self.clone();
        bus.subscribe(Subscriber::new(
            "session_engine",
            SubscriberConfig::new(vec![EventKind::TokenIssued, EventKind::TokenRefreshed])
                .with_priority(10),
            move |event| {
                let engine = engine.clone();
                async move { engine.on_event(event).await }
            },
        ));
    }

    async fn on_event(&self, event: Arc<AuthEvent>) -> Result<()> {
        if event.realm != self.realm {
            return Ok(());
        }

        match &event.data {
            EventData::TokenIssued {
                user_id,
                token_family,
                source_ip,
                user_agent,
                latitude,
                longitude,
                issued_at,
            } => {
                self.handle_token_issued(
                    *user_id,
                    *token_family,
                    source_ip.as_deref(),
                    user_agent.as_deref(),
                    *latitude,
                    *longitude,
                    *issued_at,
                )
                .await?;
            }
            EventData::TokenRefreshed {
                token_family,
                refreshed_at,
                ..
            } => {
                self.handle_token_refreshed(*token_family, *refreshed_at)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Create a session for a freshly issued token family. Issuance without a
    /// known source IP leaves no session behind.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_token_issued(
        &self,
        user_id: UserId,
        token_family: TokenFamily,
        source_ip: Option<&str>,
        user_agent: Option<&str>,
        latitude: Option<f64>,
        longitude: Option<f64>,
        issued_at: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let ip = match source_ip {
            Some(ip) => ip,
            None => return Ok(None),
        };

        let session = Session {
            id: SessionId::new(),
            user_id,
            token_family,
            device_fingerprint: user_agent.map(|ua| device::fingerprint(ip, ua)),
            device_name: user_agent.map(device::device_name),
            ip_address: Some(ip.to_string()),
            user_agent: user_agent.map(String::from),
            latitude,
            longitude,
            created_at: issued_at,
            last_activity_at: issued_at,
            expires_at: issued_at + self.config.session_expiration,
            status: SessionStatus::Active,
            revoked_reason: None,
            revoked_at: None,
        };

        // Prior footprints for anomaly detection, gathered before the insert
        // so the new session never counts as its own precedent.
        let mut priors: Vec<PriorFootprint> = self
            .store
            .list_for_user(user_id)
            .await?
            .iter()
            .map(PriorFootprint::from)
            .collect();
        for entry in self.store.history_for_user(user_id, 100, 0).await? {
            priors.push(PriorFootprint::from(&entry.session));
        }

        let evicted = self
            .store
            .insert_with_cap(
                &session,
                self.config.max_concurrent_sessions,
                REASON_MAX_SESSIONS,
                self.clock.now(),
            )
            .await?;

        if let Some(evicted) = &evicted {
            tracing::info!(
                realm = %self.realm,
                user_id = %user_id,
                session_id = %evicted.id,
                "Oldest session evicted by concurrency cap"
            );
            self.bus
                .publish(AuthEvent::new(
                    &self.realm,
                    EventData::SessionRevoked {
                        user_id,
                        session_id: evicted.id,
                        reason: REASON_MAX_SESSIONS.to_string(),
                    },
                ))
                .await?;
        }

        self.bus
            .publish(AuthEvent::new(
                &self.realm,
                EventData::SessionCreated {
                    user_id,
                    session_id: session.id,
                    token_family,
                },
            ))
            .await?;

        for anomaly in self.detector.detect(&session, &priors) {
            tracing::warn!(
                realm = %self.realm,
                user_id = %user_id,
                session_id = %session.id,
                anomaly = anomaly.as_str(),
                "Session anomaly detected"
            );
            self.bus
                .publish(AuthEvent::new(
                    &self.realm,
                    EventData::SessionAnomaly {
                        user_id,
                        session_id: session.id,
                        anomaly,
                    },
                ))
                .await?;
        }

        Ok(Some(session))
    }

    /// Slide activity and expiry for the family's session
    pub async fn handle_token_refreshed(
        &self,
        token_family: TokenFamily,
        refreshed_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.store
            .touch_by_family(
                token_family,
                refreshed_at,
                refreshed_at + self.config.session_expiration,
            )
            .await
    }

    /// Revoke a session; optionally archive terminated rows immediately
    pub async fn revoke(
        &self,
        session_id: SessionId,
        reason: &str,
        archive_immediately: bool,
    ) -> Result<Option<Session>> {
        let now = self.clock.now();
        let revoked = self.store.revoke(session_id, reason, now).await?;

        if let Some(session) = &revoked {
            self.bus
                .publish(AuthEvent::new(
                    &self.realm,
                    EventData::SessionRevoked {
                        user_id: session.user_id,
                        session_id: session.id,
                        reason: reason.to_string(),
                    },
                ))
                .await?;
        }

        if archive_immediately {
            self.store.archive_terminated(now).await?;
        }
        Ok(revoked)
    }

    /// Revoke the session owning a token family (logout path)
    pub async fn revoke_by_family(
        &self,
        token_family: TokenFamily,
        reason: &str,
    ) -> Result<Option<Session>> {
        match self.store.get_by_family(token_family).await? {
            Some(session) => self.revoke(session.id, reason, false).await,
            None => Ok(None),
        }
    }

    pub async fn revoke_all_for_user(&self, user_id: UserId, reason: &str) -> Result<u64> {
        self.store
            .revoke_all_for_user(user_id, reason, self.clock.now())
            .await
    }

    pub async fn list_active(&self, user_id: UserId) -> Result<Vec<Session>> {
        Ok(self
            .store
            .list_for_user(user_id)
            .await?
            .into_iter()
            .filter(Session::is_active)
            .collect())
    }

    pub async fn get_by_family(&self, token_family: TokenFamily) -> Result<Option<Session>> {
        self.store.get_by_family(token_family).await
    }

    pub async fn history(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SessionHistoryEntry>> {
        self.store.history_for_user(user_id, limit, offset).await
    }

    /// One cleanup iteration: expire, archive, prune. Safe to run
    /// concurrently with itself.
    pub async fn cleanup_pass(&self) -> Result<CleanupStats> {
        let now = self.clock.now();
        let expired = self.store.mark_expired(now).await?;
        let archived = self.store.archive_terminated(now).await?;
        let pruned_history = self
            .store
            .prune_history_before(now - self.config.session_history_retention)
            .await?;

        if expired > 0 || archived > 0 || pruned_history > 0 {
            tracing::debug!(
                realm = %self.realm,
                expired,
                archived,
                pruned_history,
                "Session cleanup pass"
            );
        }

        Ok(CleanupStats {
            expired,
            archived,
            pruned_history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionStore;
    use chrono::Duration;
    use realmgate_core::clock::{Clock, FixedClock};

    const UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
        AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const NEW_YORK: (f64, f64) = (40.7128, -74.0060);
    const LOS_ANGELES: (f64, f64) = (34.0522, -118.2437);

    struct Fixture {
        engine: Arc<SessionEngine<InMemorySessionStore>>,
        clock: FixedClock,
        bus: Arc<EventBus>,
    }

    fn fixture(config: SessionConfig) -> Fixture {
        let clock = FixedClock::for_tests();
        let bus = Arc::new(EventBus::new("acme"));
        let engine = Arc::new(SessionEngine::new(
            "acme",
            config,
            Arc::new(InMemorySessionStore::new()),
            Arc::new(clock.clone()),
            bus.clone(),
        ));
        Fixture { engine, clock, bus }
    }

    async fn issue(
        f: &Fixture,
        user_id: UserId,
        ip: &str,
        coords: Option<(f64, f64)>,
    ) -> Option<Session> {
        f.engine
            .handle_token_issued(
                user_id,
                TokenFamily::new(),
                Some(ip),
                Some(UA),
                coords.map(|c| c.0),
                coords.map(|c| c.1),
                f.clock.now(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_session_created_from_token_issue() {
        let f = fixture(SessionConfig::default());
        let user_id = UserId::new();

        let session = issue(&f, user_id, "10.0.0.1", None).await.unwrap();
        assert!(session.device_fingerprint.is_some());
        assert_eq!(session.device_name.as_deref(), Some("Chrome on macOS"));

        let active = f.engine.list_active(user_id).await.unwrap();
        assert_eq!(active.len(), 1);
        f.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_session_without_source_ip() {
        let f = fixture(SessionConfig::default());
        let created = f
            .engine
            .handle_token_issued(
                UserId::new(),
                TokenFamily::new(),
                None,
                Some(UA),
                None,
                None,
                f.clock.now(),
            )
            .await
            .unwrap();
        assert!(created.is_none());
        f.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_sixth_session_evicts_oldest() {
        let f = fixture(SessionConfig {
            max_concurrent_sessions: 5,
            ..Default::default()
        });
        let user_id = UserId::new();

        let mut sessions = Vec::new();
        for _ in 0..5 {
            sessions.push(issue(&f, user_id, "10.0.0.1", None).await.unwrap());
            f.clock.advance(Duration::seconds(1));
        }

        issue(&f, user_id, "10.0.0.1", None).await.unwrap();

        let active = f.engine.list_active(user_id).await.unwrap();
        assert_eq!(active.len(), 5);
        assert!(!active.iter().any(|s| s.id == sessions[0].id));

        let history = f.engine.history(user_id, 10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].session.id, sessions[0].id);
        assert_eq!(
            history[0].session.revoked_reason.as_deref(),
            Some(REASON_MAX_SESSIONS)
        );
        f.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_location_anomaly() {
        let f = fixture(SessionConfig::default());
        let user_id = UserId::new();
        let mut tap = f.bus.subscribe_broadcast();

        issue(&f, user_id, "10.0.0.1", Some(NEW_YORK)).await.unwrap();
        issue(&f, user_id, "10.0.0.1", Some(LOS_ANGELES)).await.unwrap();
        // ~10 km from the New York session; not an anomaly.
        issue(&f, user_id, "10.0.0.1", Some((40.8028, -74.0060))).await.unwrap();

        f.bus.shutdown().await;

        let mut anomalies = Vec::new();
        while let Ok(event) = tap.try_recv() {
            if let EventData::SessionAnomaly { anomaly, .. } = &event.data {
                anomalies.push(*anomaly);
            }
        }
        assert_eq!(anomalies, vec![realmgate_events::AnomalyKind::NewLocation]);
    }

    #[tokio::test]
    async fn test_refresh_slides_expiry() {
        let f = fixture(SessionConfig::default());
        let user_id = UserId::new();
        let session = issue(&f, user_id, "10.0.0.1", None).await.unwrap();

        f.clock.advance(Duration::hours(1));
        assert!(f
            .engine
            .handle_token_refreshed(session.token_family, f.clock.now())
            .await
            .unwrap());

        let updated = f
            .engine
            .get_by_family(session.token_family)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.expires_at, f.clock.now() + Duration::hours(24));
        f.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_cleanup_expires_archives_and_prunes() {
        let f = fixture(SessionConfig {
            session_expiration: Duration::hours(1),
            session_history_retention: Duration::days(7),
            ..Default::default()
        });
        let user_id = UserId::new();
        issue(&f, user_id, "10.0.0.1", None).await.unwrap();

        f.clock.advance(Duration::hours(2));
        let stats = f.engine.cleanup_pass().await.unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.archived, 1);
        assert!(f.engine.list_active(user_id).await.unwrap().is_empty());
        assert_eq!(f.engine.history(user_id, 10, 0).await.unwrap().len(), 1);

        // A second pass has nothing left to do.
        let again = f.engine.cleanup_pass().await.unwrap();
        assert_eq!(again, CleanupStats::default());

        // Past retention, history rows are pruned.
        f.clock.advance(Duration::days(8));
        let pruned = f.engine.cleanup_pass().await.unwrap();
        assert_eq!(pruned.pruned_history, 1);
        assert!(f.engine.history(user_id, 10, 0).await.unwrap().is_empty());
        f.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_logout_revokes_by_family() {
        let f = fixture(SessionConfig::default());
        let user_id = UserId::new();
        let session = issue(&f, user_id, "10.0.0.1", None).await.unwrap();

        let revoked = f
            .engine
            .revoke_by_family(session.token_family, "logout")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(revoked.status, SessionStatus::Revoked);
        assert!(f.engine.list_active(user_id).await.unwrap().is_empty());
        f.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_event_subscription_creates_session() {
        let f = fixture(SessionConfig::default());
        let user_id = UserId::new();
        f.engine.register_subscribers(&f.bus);

        f.bus
            .publish(AuthEvent::new(
                "acme",
                EventData::TokenIssued {
                    user_id,
                    token_family: TokenFamily::new(),
                    source_ip: Some("10.0.0.1".into()),
                    user_agent: Some(UA.into()),
                    latitude: None,
                    longitude: None,
                    issued_at: f.clock.now(),
                },
            ))
            .await
            .unwrap();
        f.bus.shutdown().await;

        assert_eq!(f.engine.list_active(user_id).await.unwrap().len(), 1);
    }
}
