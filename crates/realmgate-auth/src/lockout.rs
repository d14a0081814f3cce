//! Account lockout and throttling engine.
//!
//! Two sliding windows guard the login path: one keyed by the presented
//! identifier, one by source IP with a 4x threshold. Account locks are
//! persisted rows checked against the clock on every decision; nothing is
//! enforced by in-process timers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use realmgate_core::clock::SharedClock;
use realmgate_core::config::LockoutPolicy;
use realmgate_core::error::Result;
use realmgate_core::id::{AttemptId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A recorded failed authentication attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub id: AttemptId,
    pub identifier: String,
    pub user_id: Option<UserId>,
    pub ip_address: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub reason: String,
}

/// An account lock row; `locked_until = None` means indefinite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountLock {
    pub user_id: UserId,
    pub locked_until: Option<DateTime<Utc>>,
    pub reason: String,
    pub locked_at: DateTime<Utc>,
}

impl AccountLock {
    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        match self.locked_until {
            None => true,
            Some(until) => at < until,
        }
    }
}

/// Throttle decision for an identifier or IP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    NotThrottled,
    Throttled { attempt_count: u32 },
}

impl ThrottleDecision {
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }
}

/// Lock recommendation after a failure was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDecision {
    NoAction,
    ShouldLock { attempt_count: u32 },
}

/// Storage contract for failed attempts and account locks
#[async_trait]
pub trait LockoutStore: Send + Sync {
    async fn insert_attempt(&self, attempt: &FailedAttempt) -> Result<()>;

    /// Delete attempts for an identifier older than the cutoff
    async fn prune_attempts_before(&self, identifier: &str, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn count_for_identifier(&self, identifier: &str, since: DateTime<Utc>) -> Result<u32>;

    async fn count_for_ip(&self, ip: &str, since: DateTime<Utc>) -> Result<u32>;

    async fn count_for_user(&self, user_id: UserId, since: DateTime<Utc>) -> Result<u32>;

    async fn clear_for_identifier(&self, identifier: &str) -> Result<u64>;

    async fn clear_for_user(&self, user_id: UserId) -> Result<u64>;

    /// Insert or replace the lock row for a user
    async fn upsert_lock(&self, lock: &AccountLock) -> Result<()>;

    async fn get_lock(&self, user_id: UserId) -> Result<Option<AccountLock>>;

    async fn delete_lock(&self, user_id: UserId) -> Result<()>;
}

/// Lockout engine for one realm
pub struct LockoutEngine<S: LockoutStore + ?Sized> {
    policy: LockoutPolicy,
    store: Arc<S>,
    clock: SharedClock,
}

impl<S: LockoutStore + ?Sized> LockoutEngine<S> {
    pub fn new(policy: LockoutPolicy, store: Arc<S>, clock: SharedClock) -> Self {
        Self {
            policy,
            store,
            clock,
        }
    }

    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    /// Record a failed attempt; opportunistically prunes rows older than the
    /// window for the same identifier.
    pub async fn record_failed_attempt(
        &self,
        identifier: &str,
        user_id: Option<UserId>,
        ip_address: Option<&str>,
        reason: &str,
    ) -> Result<FailedAttempt> {
        let now = self.clock.now();
        let attempt = FailedAttempt {
            id: AttemptId::new(),
            identifier: identifier.to_string(),
            user_id,
            ip_address: ip_address.map(String::from),
            attempted_at: now,
            reason: reason.to_string(),
        };

        self.store.insert_attempt(&attempt).await?;
        self.store
            .prune_attempts_before(identifier, now - self.policy.attempt_window)
            .await?;

        Ok(attempt)
    }

    /// Sliding-window count for the identifier against `max_failed_attempts`
    pub async fn should_throttle_identifier(&self, identifier: &str) -> Result<ThrottleDecision> {
        if !self.policy.enabled {
            return Ok(ThrottleDecision::NotThrottled);
        }

        let since = self.clock.now() - self.policy.attempt_window;
        let count = self.store.count_for_identifier(identifier, since).await?;

        if count >= self.policy.max_failed_attempts {
            Ok(ThrottleDecision::Throttled {
                attempt_count: count,
            })
        } else {
            Ok(ThrottleDecision::NotThrottled)
        }
    }

    /// Sliding-window count for the IP against `4 x max_failed_attempts`
    pub async fn should_throttle_ip(&self, ip: &str) -> Result<ThrottleDecision> {
        if !self.policy.enabled {
            return Ok(ThrottleDecision::NotThrottled);
        }

        let since = self.clock.now() - self.policy.attempt_window;
        let count = self.store.count_for_ip(ip, since).await?;

        if count >= self.policy.ip_threshold() {
            Ok(ThrottleDecision::Throttled {
                attempt_count: count,
            })
        } else {
            Ok(ThrottleDecision::NotThrottled)
        }
    }

    /// Whether the user's own attempts warrant a lock. Attempts recorded
    /// without a user id do not contribute.
    pub async fn should_lock_account(&self, user_id: UserId) -> Result<LockDecision> {
        if !self.policy.enabled {
            return Ok(LockDecision::NoAction);
        }

        let since = self.clock.now() - self.policy.attempt_window;
        let count = self.store.count_for_user(user_id, since).await?;

        if count >= self.policy.max_failed_attempts {
            Ok(LockDecision::ShouldLock {
                attempt_count: count,
            })
        } else {
            Ok(LockDecision::NoAction)
        }
    }

    /// Lock the account; `until = None` locks indefinitely
    pub async fn lock_account(
        &self,
        user_id: UserId,
        until: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<AccountLock> {
        let lock = AccountLock {
            user_id,
            locked_until: until,
            reason: reason.to_string(),
            locked_at: self.clock.now(),
        };
        self.store.upsert_lock(&lock).await?;
        tracing::warn!(user_id = %user_id, reason, "Account locked");
        Ok(lock)
    }

    /// Lock for the policy's configured duration
    pub async fn lock_account_for_policy_duration(
        &self,
        user_id: UserId,
        reason: &str,
    ) -> Result<AccountLock> {
        let until = self.clock.now() + self.policy.lockout_duration;
        self.lock_account(user_id, Some(until), reason).await
    }

    pub async fn unlock_account(&self, user_id: UserId) -> Result<()> {
        self.store.delete_lock(user_id).await
    }

    /// `lockedUntil = None` means indefinite; otherwise `at < lockedUntil`
    pub async fn is_account_locked(&self, user_id: UserId, at: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .store
            .get_lock(user_id)
            .await?
            .map(|lock| lock.is_active(at))
            .unwrap_or(false))
    }

    pub async fn get_lock(&self, user_id: UserId) -> Result<Option<AccountLock>> {
        self.store.get_lock(user_id).await
    }

    pub async fn clear_failed_attempts_for_identifier(&self, identifier: &str) -> Result<u64> {
        self.store.clear_for_identifier(identifier).await
    }

    pub async fn clear_failed_attempts_for_user(&self, user_id: UserId) -> Result<u64> {
        self.store.clear_for_user(user_id).await
    }

    /// Post-login bookkeeping: clear the user's attempts and drop any timed
    /// lock that has already elapsed. Indefinite locks stay.
    pub async fn handle_successful_login(&self, user_id: UserId, identifier: &str) -> Result<()> {
        self.store.clear_for_user(user_id).await?;
        self.store.clear_for_identifier(identifier).await?;

        if let Some(lock) = self.store.get_lock(user_id).await? {
            if let Some(until) = lock.locked_until {
                if until <= self.clock.now() {
                    self.store.delete_lock(user_id).await?;
                }
            }
        }
        Ok(())
    }
}

/// In-memory lockout store
pub struct InMemoryLockoutStore {
    attempts: RwLock<Vec<FailedAttempt>>,
    locks: RwLock<HashMap<UserId, AccountLock>>,
}

impl InMemoryLockoutStore {
    pub fn new() -> Self {
        Self {
            attempts: RwLock::new(Vec::new()),
            locks: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryLockoutStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockoutStore for InMemoryLockoutStore {
    async fn insert_attempt(&self, attempt: &FailedAttempt) -> Result<()> {
        self.attempts.write().push(attempt.clone());
        Ok(())
    }

    async fn prune_attempts_before(&self, identifier: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut attempts = self.attempts.write();
        let before = attempts.len();
        attempts.retain(|a| !(a.identifier == identifier && a.attempted_at <= cutoff));
        Ok((before - attempts.len()) as u64)
    }

    async fn count_for_identifier(&self, identifier: &str, since: DateTime<Utc>) -> Result<u32> {
        Ok(self
            .attempts
            .read()
            .iter()
            .filter(|a| a.identifier == identifier && a.attempted_at > since)
            .count() as u32)
    }

    async fn count_for_ip(&self, ip: &str, since: DateTime<Utc>) -> Result<u32> {
        Ok(self
            .attempts
            .read()
            .iter()
            .filter(|a| a.ip_address.as_deref() == Some(ip) && a.attempted_at > since)
            .count() as u32)
    }

    async fn count_for_user(&self, user_id: UserId, since: DateTime<Utc>) -> Result<u32> {
        Ok(self
            .attempts
            .read()
            .iter()
            .filter(|a| a.user_id == Some(user_id) && a.attempted_at > since)
            .count() as u32)
    }

    async fn clear_for_identifier(&self, identifier: &str) -> Result<u64> {
        let mut attempts = self.attempts.write();
        let before = attempts.len();
        attempts.retain(|a| a.identifier != identifier);
        Ok((before - attempts.len()) as u64)
    }

    async fn clear_for_user(&self, user_id: UserId) -> Result<u64> {
        let mut attempts = self.attempts.write();
        let before = attempts.len();
        attempts.retain(|a| a.user_id != Some(user_id));
        Ok((before - attempts.len()) as u64)
    }

    async fn upsert_lock(&self, lock: &AccountLock) -> Result<()> {
        self.locks.write().insert(lock.user_id, lock.clone());
        Ok(())
    }

    async fn get_lock(&self, user_id: UserId) -> Result<Option<AccountLock>> {
        Ok(self.locks.read().get(&user_id).cloned())
    }

    async fn delete_lock(&self, user_id: UserId) -> Result<()> {
        self.locks.write().remove(&user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use realmgate_core::clock::{Clock, FixedClock};

    fn engine(policy: LockoutPolicy, clock: FixedClock) -> LockoutEngine<InMemoryLockoutStore> {
        LockoutEngine::new(policy, Arc::new(InMemoryLockoutStore::new()), Arc::new(clock))
    }

    #[tokio::test]
    async fn test_throttle_by_identifier() {
        let policy = LockoutPolicy {
            max_failed_attempts: 3,
            attempt_window: Duration::minutes(15),
            ..LockoutPolicy::moderate()
        };
        let engine = engine(policy, FixedClock::for_tests());

        for _ in 0..3 {
            engine
                .record_failed_attempt("user@example.com", None, None, "invalid_credentials")
                .await
                .unwrap();
        }

        assert_eq!(
            engine
                .should_throttle_identifier("user@example.com")
                .await
                .unwrap(),
            ThrottleDecision::Throttled { attempt_count: 3 }
        );
    }

    #[tokio::test]
    async fn test_ip_throttle_independent_of_identifiers() {
        let policy = LockoutPolicy {
            max_failed_attempts: 3,
            ..LockoutPolicy::moderate()
        };
        let engine = engine(policy, FixedClock::for_tests());

        // 2 failures each from 6 distinct identifiers, same IP.
        for i in 0..6 {
            for _ in 0..2 {
                engine
                    .record_failed_attempt(
                        &format!("user{i}@example.com"),
                        None,
                        Some("10.0.0.1"),
                        "invalid_credentials",
                    )
                    .await
                    .unwrap();
            }
        }

        assert_eq!(
            engine.should_throttle_ip("10.0.0.1").await.unwrap(),
            ThrottleDecision::Throttled { attempt_count: 12 }
        );
        assert_eq!(
            engine
                .should_throttle_identifier("user0@example.com")
                .await
                .unwrap(),
            ThrottleDecision::NotThrottled
        );
    }

    #[tokio::test]
    async fn test_window_excludes_old_attempts() {
        let clock = FixedClock::for_tests();
        let policy = LockoutPolicy {
            max_failed_attempts: 3,
            attempt_window: Duration::minutes(15),
            ..LockoutPolicy::moderate()
        };
        let engine = LockoutEngine::new(
            policy,
            Arc::new(InMemoryLockoutStore::new()),
            Arc::new(clock.clone()),
        );

        for _ in 0..3 {
            engine
                .record_failed_attempt("user@example.com", None, None, "invalid_credentials")
                .await
                .unwrap();
        }
        clock.advance(Duration::minutes(16));

        assert_eq!(
            engine
                .should_throttle_identifier("user@example.com")
                .await
                .unwrap(),
            ThrottleDecision::NotThrottled
        );
    }

    #[tokio::test]
    async fn test_disabled_policy_never_throttles() {
        let engine = engine(LockoutPolicy::disabled(), FixedClock::for_tests());

        for _ in 0..50 {
            engine
                .record_failed_attempt("user@example.com", None, Some("10.0.0.1"), "bad")
                .await
                .unwrap();
        }

        assert!(!engine
            .should_throttle_identifier("user@example.com")
            .await
            .unwrap()
            .is_throttled());
        assert!(!engine
            .should_throttle_ip("10.0.0.1")
            .await
            .unwrap()
            .is_throttled());
    }

    #[tokio::test]
    async fn test_userless_attempts_do_not_lock_account() {
        let policy = LockoutPolicy {
            max_failed_attempts: 3,
            ..LockoutPolicy::moderate()
        };
        let engine = engine(policy, FixedClock::for_tests());
        let user_id = UserId::new();

        for _ in 0..3 {
            engine
                .record_failed_attempt("user@example.com", None, None, "bad")
                .await
                .unwrap();
        }
        assert_eq!(
            engine.should_lock_account(user_id).await.unwrap(),
            LockDecision::NoAction
        );

        for _ in 0..3 {
            engine
                .record_failed_attempt("user@example.com", Some(user_id), None, "bad")
                .await
                .unwrap();
        }
        assert_eq!(
            engine.should_lock_account(user_id).await.unwrap(),
            LockDecision::ShouldLock { attempt_count: 3 }
        );
    }

    #[tokio::test]
    async fn test_lock_semantics() {
        let clock = FixedClock::for_tests();
        let engine = LockoutEngine::new(
            LockoutPolicy::moderate(),
            Arc::new(InMemoryLockoutStore::new()),
            Arc::new(clock.clone()),
        );
        let user_id = UserId::new();
        let now = clock.now();

        // Timed lock.
        engine
            .lock_account(user_id, Some(now + Duration::minutes(30)), "too many attempts")
            .await
            .unwrap();
        assert!(engine.is_account_locked(user_id, now).await.unwrap());
        assert!(!engine
            .is_account_locked(user_id, now + Duration::minutes(31))
            .await
            .unwrap());

        // Indefinite lock.
        engine.lock_account(user_id, None, "admin").await.unwrap();
        assert!(engine
            .is_account_locked(user_id, now + Duration::days(365))
            .await
            .unwrap());

        engine.unlock_account(user_id).await.unwrap();
        assert!(!engine.is_account_locked(user_id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_successful_login_clears_attempts_and_elapsed_locks() {
        let clock = FixedClock::for_tests();
        let engine = LockoutEngine::new(
            LockoutPolicy::moderate(),
            Arc::new(InMemoryLockoutStore::new()),
            Arc::new(clock.clone()),
        );
        let user_id = UserId::new();

        engine
            .record_failed_attempt("user@example.com", Some(user_id), None, "bad")
            .await
            .unwrap();
        engine
            .lock_account(user_id, Some(clock.now() + Duration::minutes(5)), "attempts")
            .await
            .unwrap();

        clock.advance(Duration::minutes(10));
        engine
            .handle_successful_login(user_id, "user@example.com")
            .await
            .unwrap();

        assert!(!engine.is_account_locked(user_id, clock.now()).await.unwrap());
        assert_eq!(
            engine.should_lock_account(user_id).await.unwrap(),
            LockDecision::NoAction
        );

        // An indefinite lock survives login bookkeeping.
        engine.lock_account(user_id, None, "admin").await.unwrap();
        engine
            .handle_successful_login(user_id, "user@example.com")
            .await
            .unwrap();
        assert!(engine.is_account_locked(user_id, clock.now()).await.unwrap());
    }
}
