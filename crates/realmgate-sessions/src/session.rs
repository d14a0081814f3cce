//! Session entity, history, and the storage contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use realmgate_core::error::{Error, Result};
use realmgate_core::id::{SessionId, TokenFamily, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Active,
    Expired,
    Revoked,
}

/// A live session row; exactly one per active token family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub token_family: TokenFamily,
    pub device_fingerprint: Option<String>,
    pub device_name: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub revoked_reason: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// Append-only archive row for a terminated session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHistoryEntry {
    pub session: Session,
    pub archived_at: DateTime<Utc>,
}

/// Storage contract for sessions.
///
/// `insert_with_cap` and `archive_terminated` are single calls so an
/// implementation can make each one transaction; the in-memory store runs
/// them under one lock. Concurrent cleanup passes must not double-archive.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert an ACTIVE session. When the user already holds
    /// `max_concurrent` active sessions, the oldest is revoked with
    /// `evict_reason`, archived, and returned. Count and eviction are atomic
    /// with the insert.
    async fn insert_with_cap(
        &self,
        session: &Session,
        max_concurrent: usize,
        evict_reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>>;

    async fn get(&self, id: SessionId) -> Result<Option<Session>>;

    async fn get_by_family(&self, family: TokenFamily) -> Result<Option<Session>>;

    /// Live rows for the user, any status
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Session>>;

    async fn count_active_for_user(&self, user_id: UserId) -> Result<usize>;

    /// Slide activity and expiry for the session keyed by token family
    async fn touch_by_family(
        &self,
        family: TokenFamily,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Mark REVOKED with a reason; returns the updated row
    async fn revoke(
        &self,
        id: SessionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>>;

    async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Flip ACTIVE rows whose `expires_at < now` to EXPIRED
    async fn mark_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Move every EXPIRED/REVOKED row to history and delete it from the live
    /// table; idempotent under concurrent invocation
    async fn archive_terminated(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn history_for_user(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SessionHistoryEntry>>;

    /// Delete history entries archived before the cutoff
    async fn prune_history_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// In-memory session store
pub struct InMemorySessionStore {
    inner: RwLock<Inner>,
}

struct Inner {
    sessions: HashMap<SessionId, Session>,
    history: Vec<SessionHistoryEntry>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                history: Vec::new(),
            }),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert_with_cap(
        &self,
        session: &Session,
        max_concurrent: usize,
        evict_reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let mut inner = self.inner.write();

        if inner
            .sessions
            .values()
            .any(|s| s.token_family == session.token_family)
        {
            return Err(Error::integrity("token family already has a session"));
        }

        let mut evicted = None;
        let active: Vec<SessionId> = {
            let mut active: Vec<&Session> = inner
                .sessions
                .values()
                .filter(|s| s.user_id == session.user_id && s.is_active())
                .collect();
            active.sort_by_key(|s| s.created_at);
            active.iter().map(|s| s.id).collect()
        };

        if active.len() >= max_concurrent {
            let oldest_id = active[0];
            if let Some(mut oldest) = inner.sessions.remove(&oldest_id) {
                oldest.status = SessionStatus::Revoked;
                oldest.revoked_reason = Some(evict_reason.to_string());
                oldest.revoked_at = Some(now);
                oldest.last_activity_at = now;
                inner.history.push(SessionHistoryEntry {
                    session: oldest.clone(),
                    archived_at: now,
                });
                evicted = Some(oldest);
            }
        }

        inner.sessions.insert(session.id, session.clone());
        Ok(evicted)
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>> {
        Ok(self.inner.read().sessions.get(&id).cloned())
    }

    async fn get_by_family(&self, family: TokenFamily) -> Result<Option<Session>> {
        Ok(self
            .inner
            .read()
            .sessions
            .values()
            .find(|s| s.token_family == family)
            .cloned())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .inner
            .read()
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn count_active_for_user(&self, user_id: UserId) -> Result<usize> {
        Ok(self
            .inner
            .read()
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active())
            .count())
    }

    async fn touch_by_family(
        &self,
        family: TokenFamily,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        for session in inner.sessions.values_mut() {
            if session.token_family == family && session.is_active() {
                session.last_activity_at = now;
                session.expires_at = expires_at;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn revoke(
        &self,
        id: SessionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let mut inner = self.inner.write();
        if let Some(session) = inner.sessions.get_mut(&id) {
            if session.is_active() {
                session.status = SessionStatus::Revoked;
                session.revoked_reason = Some(reason.to_string());
                session.revoked_at = Some(now);
                session.last_activity_at = now;
            }
            return Ok(Some(session.clone()));
        }
        Ok(None)
    }

    async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.write();
        let mut count = 0;
        for session in inner.sessions.values_mut() {
            if session.user_id == user_id && session.is_active() {
                session.status = SessionStatus::Revoked;
                session.revoked_reason = Some(reason.to_string());
                session.revoked_at = Some(now);
                session.last_activity_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn mark_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write();
        let mut count = 0;
        for session in inner.sessions.values_mut() {
            if session.is_active() && session.expires_at < now {
                session.status = SessionStatus::Expired;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn archive_terminated(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write();
        let terminated: Vec<SessionId> = inner
            .sessions
            .values()
            .filter(|s| !s.is_active())
            .map(|s| s.id)
            .collect();

        let mut count = 0;
        for id in terminated {
            if let Some(session) = inner.sessions.remove(&id) {
                inner.history.push(SessionHistoryEntry {
                    session,
                    archived_at: now,
                });
                count += 1;
            }
        }
        Ok(count)
    }

    async fn history_for_user(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SessionHistoryEntry>> {
        let inner = self.inner.read();
        let mut entries: Vec<SessionHistoryEntry> = inner
            .history
            .iter()
            .filter(|e| e.session.user_id == user_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.archived_at.cmp(&a.archived_at));
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    async fn prune_history_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write();
        let before = inner.history.len();
        inner.history.retain(|e| e.archived_at >= cutoff);
        Ok((before - inner.history.len()) as u64)
    }
}
