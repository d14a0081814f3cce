//! MFA backup codes.
//!
//! A batch of one-use codes stored hashed, indexed per user. Regenerating a
//! batch replaces everything outstanding. Consumption is a single store call
//! so exactly one verification can spend a given code.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use realmgate_core::clock::SharedClock;
use realmgate_core::error::Result;
use realmgate_core::id::UserId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// One stored backup code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaBackupCode {
    pub user_id: UserId,
    pub index: usize,
    pub code_hash: String,
    pub used_at: Option<DateTime<Utc>>,
}

/// Storage contract for backup codes
#[async_trait]
pub trait BackupCodeStore: Send + Sync {
    /// Replace the user's whole batch
    async fn replace_for_user(&self, user_id: UserId, codes: Vec<MfaBackupCode>) -> Result<()>;

    /// Atomically consume the unused code matching `code_hash`; true when one
    /// was spent
    async fn consume(&self, user_id: UserId, code_hash: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Count of unspent codes
    async fn remaining(&self, user_id: UserId) -> Result<usize>;

    async fn delete_for_user(&self, user_id: UserId) -> Result<()>;
}

/// Backup-code generation and verification
pub struct BackupCodeManager<S: BackupCodeStore + ?Sized> {
    store: Arc<S>,
    clock: SharedClock,
    count: usize,
}

impl<S: BackupCodeStore + ?Sized> BackupCodeManager<S> {
    pub fn new(store: Arc<S>, clock: SharedClock, count: usize) -> Self {
        Self {
            store,
            clock,
            count,
        }
    }

    fn generate_code() -> String {
        let mut rng = rand::thread_rng();
        let code: String = (0..8)
            .map(|_| {
                let idx = rng.gen_range(0..36);
                if idx < 10 {
                    (b'0' + idx) as char
                } else {
                    (b'A' + idx - 10) as char
                }
            })
            .collect();
        format!("{}-{}", &code[0..4], &code[4..8])
    }

    fn hash_code(code: &str) -> String {
        let normalized = code.to_uppercase();
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Generate a fresh batch; the plaintext list is returned exactly once
    pub async fn generate(&self, user_id: UserId) -> Result<Vec<String>> {
        let plaintext: Vec<String> = (0..self.count).map(|_| Self::generate_code()).collect();

        let stored = plaintext
            .iter()
            .enumerate()
            .map(|(index, code)| MfaBackupCode {
                user_id,
                index,
                code_hash: Self::hash_code(code),
                used_at: None,
            })
            .collect();

        self.store.replace_for_user(user_id, stored).await?;
        Ok(plaintext)
    }

    /// Spend a presented code; each code verifies at most once
    pub async fn verify(&self, user_id: UserId, code: &str) -> Result<bool> {
        self.store
            .consume(user_id, &Self::hash_code(code), self.clock.now())
            .await
    }

    pub async fn remaining(&self, user_id: UserId) -> Result<usize> {
        self.store.remaining(user_id).await
    }

    pub async fn remove_all(&self, user_id: UserId) -> Result<()> {
        self.store.delete_for_user(user_id).await
    }
}

/// In-memory backup-code store
pub struct InMemoryBackupCodeStore {
    codes: RwLock<HashMap<UserId, Vec<MfaBackupCode>>>,
}

impl InMemoryBackupCodeStore {
    pub fn new() -> Self {
        Self {
            codes: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryBackupCodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackupCodeStore for InMemoryBackupCodeStore {
    async fn replace_for_user(&self, user_id: UserId, codes: Vec<MfaBackupCode>) -> Result<()> {
        self.codes.write().insert(user_id, codes);
        Ok(())
    }

    async fn consume(&self, user_id: UserId, code_hash: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut codes = self.codes.write();
        if let Some(batch) = codes.get_mut(&user_id) {
            if let Some(code) = batch
                .iter_mut()
                .find(|c| c.code_hash == code_hash && c.used_at.is_none())
            {
                code.used_at = Some(at);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn remaining(&self, user_id: UserId) -> Result<usize> {
        Ok(self
            .codes
            .read()
            .get(&user_id)
            .map(|batch| batch.iter().filter(|c| c.used_at.is_none()).count())
            .unwrap_or(0))
    }

    async fn delete_for_user(&self, user_id: UserId) -> Result<()> {
        self.codes.write().remove(&user_id);
        Ok(())
    }
}
