//! Self-service password recovery.
//!
//! Reset tokens are random, stored only as SHA-256 digests, single-use and
//! TTL-bound. Consuming one is the trigger for the orchestrator to rotate the
//! password and revoke every live token and session for the user.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use realmgate_core::clock::SharedClock;
use realmgate_core::error::{Error, Result};
use realmgate_core::id::UserId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A stored password-reset token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetToken {
    pub id: Uuid,
    pub user_id: UserId,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub requested_ip: Option<String>,
}

impl ResetToken {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && now < self.expires_at
    }
}

/// Storage contract for reset tokens
#[async_trait]
pub trait ResetTokenStore: Send + Sync {
    async fn insert(&self, token: &ResetToken) -> Result<()>;

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<ResetToken>>;

    async fn mark_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Invalidate every unused token for a user; returns the count
    async fn invalidate_for_user(&self, user_id: UserId, at: DateTime<Utc>) -> Result<u64>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Recovery configuration
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub token_ttl: Duration,
    pub token_length: usize,
    /// Invalidate earlier outstanding tokens when a new one is requested
    pub invalidate_previous: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::hours(1),
            token_length: 32,
            invalidate_previous: true,
        }
    }
}

/// Password recovery manager
pub struct RecoveryManager<S: ResetTokenStore + ?Sized> {
    store: Arc<S>,
    config: RecoveryConfig,
    clock: SharedClock,
}

impl<S: ResetTokenStore + ?Sized> RecoveryManager<S> {
    pub fn new(store: Arc<S>, config: RecoveryConfig, clock: SharedClock) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    fn generate_token(&self) -> String {
        let mut bytes = vec![0u8; self.config.token_length];
        rand::thread_rng().fill_bytes(&mut bytes);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    }

    fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Create a reset token; the plaintext is returned once for delivery
    pub async fn request(
        &self,
        user_id: UserId,
        requested_ip: Option<&str>,
    ) -> Result<(String, ResetToken)> {
        let now = self.clock.now();
        if self.config.invalidate_previous {
            self.store.invalidate_for_user(user_id, now).await?;
        }

        let plaintext = self.generate_token();
        let token = ResetToken {
            id: Uuid::now_v7(),
            user_id,
            token_hash: Self::hash_token(&plaintext),
            created_at: now,
            expires_at: now + self.config.token_ttl,
            used_at: None,
            requested_ip: requested_ip.map(String::from),
        };

        self.store.insert(&token).await?;
        Ok((plaintext, token))
    }

    /// Look up a presented token and check it is live
    pub async fn verify(&self, plaintext: &str) -> Result<ResetToken> {
        let token = self
            .store
            .find_by_hash(&Self::hash_token(plaintext))
            .await?
            .ok_or_else(|| Error::invalid_token("unknown password reset token"))?;

        let now = self.clock.now();
        if token.used_at.is_some() {
            return Err(Error::invalid_token("password reset token already used"));
        }
        if now >= token.expires_at {
            return Err(Error::TokenExpired);
        }
        Ok(token)
    }

    /// Consume a token; exactly one consumption can succeed
    pub async fn consume(&self, plaintext: &str) -> Result<ResetToken> {
        let token = self.verify(plaintext).await?;
        self.store.mark_used(token.id, self.clock.now()).await?;
        Ok(token)
    }

    /// Invalidate every outstanding token for a user (account deletion)
    pub async fn invalidate_for_user(&self, user_id: UserId) -> Result<u64> {
        self.store.invalidate_for_user(user_id, self.clock.now()).await
    }

    pub async fn prune_expired(&self) -> Result<u64> {
        self.store.delete_expired(self.clock.now()).await
    }
}

/// In-memory reset token store
pub struct InMemoryResetTokenStore {
    tokens: RwLock<HashMap<String, ResetToken>>,
}

impl InMemoryResetTokenStore {
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryResetTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResetTokenStore for InMemoryResetTokenStore {
    async fn insert(&self, token: &ResetToken) -> Result<()> {
        self.tokens
            .write()
            .insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<ResetToken>> {
        Ok(self.tokens.read().get(token_hash).cloned())
    }

    async fn mark_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut tokens = self.tokens.write();
        for token in tokens.values_mut() {
            if token.id == id {
                token.used_at = Some(at);
                break;
            }
        }
        Ok(())
    }

    async fn invalidate_for_user(&self, user_id: UserId, at: DateTime<Utc>) -> Result<u64> {
        let mut tokens = self.tokens.write();
        let mut count = 0;
        for token in tokens.values_mut() {
            if token.user_id == user_id && token.used_at.is_none() {
                token.used_at = Some(at);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tokens = self.tokens.write();
        let before = tokens.len();
        tokens.retain(|_, t| t.expires_at > now);
        Ok((before - tokens.len()) as u64)
    }
}
