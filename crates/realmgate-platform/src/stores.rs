//! Store bundle handed to the orchestrator.
//!
//! The host supplies one implementation per entity family; the bundled
//! in-memory set backs tests and small deployments.

use std::sync::Arc;

use realmgate_audit::store::{AuditStore, InMemoryAuditStore};
use realmgate_auth::backup_codes::{BackupCodeStore, InMemoryBackupCodeStore};
use realmgate_auth::lockout::{InMemoryLockoutStore, LockoutStore};
use realmgate_auth::mfa::{InMemoryMfaStore, MfaStore};
use realmgate_auth::tokens::{InMemoryTokenStore, TokenStore};
use realmgate_auth::trusted_device::{InMemoryTrustedDeviceStore, TrustedDeviceStore};
use realmgate_sessions::session::{InMemorySessionStore, SessionStore};
use realmgate_users::recovery::{InMemoryResetTokenStore, ResetTokenStore};
use realmgate_users::user::{InMemoryUserStore, UserStore};

/// One store per entity family
pub struct RealmStores {
    pub users: Arc<dyn UserStore>,
    pub reset_tokens: Arc<dyn ResetTokenStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub lockout: Arc<dyn LockoutStore>,
    pub mfa: Arc<dyn MfaStore>,
    pub trusted_devices: Arc<dyn TrustedDeviceStore>,
    pub backup_codes: Arc<dyn BackupCodeStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub audit: Arc<dyn AuditStore>,
}

impl RealmStores {
    /// The in-memory set
    pub fn in_memory() -> Self {
        Self {
            users: Arc::new(InMemoryUserStore::new()),
            reset_tokens: Arc::new(InMemoryResetTokenStore::new()),
            tokens: Arc::new(InMemoryTokenStore::new()),
            lockout: Arc::new(InMemoryLockoutStore::new()),
            mfa: Arc::new(InMemoryMfaStore::new()),
            trusted_devices: Arc::new(InMemoryTrustedDeviceStore::new()),
            backup_codes: Arc::new(InMemoryBackupCodeStore::new()),
            sessions: Arc::new(InMemorySessionStore::new()),
            audit: Arc::new(InMemoryAuditStore::new()),
        }
    }
}
