//! MFA engine.
//!
//! Method lifecycle is a small state machine: enrollment creates a PENDING
//! method, a successful verification flips it ACTIVE, removal deletes it.
//! TOTP secrets are stored encrypted; out-of-band codes are stored as
//! digests and compared in constant time. Verification and challenge sends
//! are rate limited per `(user, method)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use realmgate_core::clock::SharedClock;
use realmgate_core::config::MfaConfig;
use realmgate_core::error::{Error, Result};
use realmgate_core::id::{ChallengeId, MethodId, UserId};
use realmgate_core::interfaces::{SecretCipher, Sender};
use realmgate_events::{AuthEvent, EventBus, EventData};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::backup_codes::{BackupCodeManager, BackupCodeStore};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::totp::{Totp, TotpConfig};
use crate::trusted_device::{TrustedDeviceManager, TrustedDeviceStore};

/// Role required for the admin operations
pub const ADMIN_ROLE: &str = "ADMIN";

const SCOPE_VERIFY: &str = "mfa_verify";
const SCOPE_SEND: &str = "mfa_send";
const SCOPE_SEND_COOLDOWN: &str = "mfa_send_cooldown";

/// Supported factor types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MfaMethodType {
    Totp,
    Email,
    Sms,
}

impl MfaMethodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Totp => "TOTP",
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
        }
    }

    /// Sender channel for out-of-band methods
    fn channel(&self) -> Option<&'static str> {
        match self {
            Self::Totp => None,
            Self::Email => Some("email"),
            Self::Sms => Some("sms"),
        }
    }
}

/// Enrollment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MfaMethodStatus {
    Pending,
    Active,
}

/// An enrolled (or pending) factor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaMethod {
    pub id: MethodId,
    pub user_id: UserId,
    pub method_type: MfaMethodType,
    /// TOTP: ciphertext of the base32 secret. Email/SMS: the contact address.
    pub secret: Vec<u8>,
    pub label: Option<String>,
    pub status: MfaMethodStatus,
    pub created_at: DateTime<Utc>,
    /// Last accepted TOTP step; guards against step reuse
    pub last_used_counter: Option<u64>,
}

impl MfaMethod {
    pub fn is_active(&self) -> bool {
        self.status == MfaMethodStatus::Active
    }

    fn contact(&self) -> Result<String> {
        String::from_utf8(self.secret.clone())
            .map_err(|_| Error::internal("malformed contact address"))
    }
}

/// A pending one-time-code challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaChallenge {
    pub id: ChallengeId,
    pub user_id: UserId,
    pub method_id: MethodId,
    pub code_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    /// Whether success should also activate the method
    pub for_enrollment: bool,
}

/// Device details accompanying a verification
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub ip: String,
    pub user_agent: String,
    pub remember_device: bool,
    pub device_name: Option<String>,
}

/// Result of starting a TOTP enrollment
#[derive(Debug, Clone)]
pub struct TotpEnrollment {
    pub method_id: MethodId,
    /// Plaintext base32 secret, shown to the user exactly once
    pub secret: String,
    pub otpauth_url: String,
}

/// Result of starting an out-of-band enrollment
#[derive(Debug, Clone)]
pub struct OobEnrollment {
    pub method_id: MethodId,
    pub challenge_id: ChallengeId,
}

/// Outcome of a challenge send
#[derive(Debug, Clone)]
pub enum ChallengeOutcome {
    Success { challenge_id: ChallengeId },
    RateLimitExceeded { retry_after_secs: u64 },
    Cooldown { retry_after_secs: u64 },
    Failed { reason: String },
}

/// Storage contract for methods and challenges
#[async_trait]
pub trait MfaStore: Send + Sync {
    async fn insert_method(&self, method: &MfaMethod) -> Result<()>;

    async fn update_method(&self, method: &MfaMethod) -> Result<()>;

    async fn delete_method(&self, id: MethodId) -> Result<()>;

    async fn get_method(&self, id: MethodId) -> Result<Option<MfaMethod>>;

    /// `(user, type)` is unique
    async fn find_method(
        &self,
        user_id: UserId,
        method_type: MfaMethodType,
    ) -> Result<Option<MfaMethod>>;

    async fn list_methods(&self, user_id: UserId) -> Result<Vec<MfaMethod>>;

    async fn delete_all_for_user(&self, user_id: UserId) -> Result<u64>;

    async fn insert_challenge(&self, challenge: &MfaChallenge) -> Result<()>;

    async fn get_challenge(&self, id: ChallengeId) -> Result<Option<MfaChallenge>>;

    /// Mark consumed if not already; true when this call spent it
    async fn consume_challenge(&self, id: ChallengeId, at: DateTime<Utc>) -> Result<bool>;

    async fn delete_expired_challenges(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// MFA engine for one realm
pub struct MfaEngine<M, D, B>
where
    M: MfaStore + ?Sized,
    D: TrustedDeviceStore + ?Sized,
    B: BackupCodeStore + ?Sized,
{
    realm: String,
    config: MfaConfig,
    store: Arc<M>,
    trusted: TrustedDeviceManager<D>,
    backup: BackupCodeManager<B>,
    limiter: Arc<dyn RateLimiter>,
    cipher: Arc<dyn SecretCipher>,
    senders: HashMap<String, Arc<dyn Sender>>,
    totp: Totp,
    clock: SharedClock,
    bus: Arc<EventBus>,
}

impl<M, D, B> MfaEngine<M, D, B>
where
    M: MfaStore + ?Sized,
    D: TrustedDeviceStore + ?Sized,
    B: BackupCodeStore + ?Sized,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        realm: impl Into<String>,
        config: MfaConfig,
        store: Arc<M>,
        trusted_store: Arc<D>,
        backup_store: Arc<B>,
        limiter: Arc<dyn RateLimiter>,
        cipher: Arc<dyn SecretCipher>,
        senders: HashMap<String, Arc<dyn Sender>>,
        clock: SharedClock,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        config.validate()?;
        let backup_count = config.backup_code_count;
        Ok(Self {
            realm: realm.into(),
            config,
            store,
            trusted: TrustedDeviceManager::new(trusted_store, clock.clone()),
            backup: BackupCodeManager::new(backup_store, clock.clone(), backup_count),
            limiter,
            cipher,
            senders,
            totp: Totp::new(TotpConfig::default()),
            clock,
            bus,
        })
    }

    pub fn trusted_devices(&self) -> &TrustedDeviceManager<D> {
        &self.trusted
    }

    fn rate_key(user_id: UserId, method_id: MethodId) -> String {
        format!("{user_id}:{method_id}")
    }

    fn hash_code(code: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(code.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn generate_code(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.config.code_length)
            .map(|_| char::from(b'0' + rng.gen_range(0..10)))
            .collect()
    }

    async fn check_verify_limit(&self, user_id: UserId, method_id: MethodId) -> Result<()> {
        let decision = self
            .limiter
            .allow(
                SCOPE_VERIFY,
                &Self::rate_key(user_id, method_id),
                self.config.verify_limit,
                self.config.verify_window,
            )
            .await?;

        match decision {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Denied { retry_after } => Err(Error::RateLimited {
                retry_after_secs: retry_after.num_seconds().max(0) as u64,
            }),
        }
    }

    async fn publish_activated(&self, method: &MfaMethod) -> Result<()> {
        self.bus
            .publish(AuthEvent::new(
                &self.realm,
                EventData::MfaMethodActivated {
                    user_id: method.user_id,
                    method_type: method.method_type.as_str().to_string(),
                },
            ))
            .await
    }

    async fn maybe_trust_device(&self, user_id: UserId, device: Option<&DeviceInfo>) -> Result<()> {
        if let Some(info) = device {
            if info.remember_device {
                self.trusted
                    .trust_device(
                        user_id,
                        &info.ip,
                        &info.user_agent,
                        info.device_name.as_deref(),
                        self.config.trusted_device_days,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    // === Enrollment ===

    /// Start TOTP enrollment; replaces any pending TOTP enrollment in place
    pub async fn enroll_totp(&self, user_id: UserId, label: &str) -> Result<TotpEnrollment> {
        if let Some(existing) = self.store.find_method(user_id, MfaMethodType::Totp).await? {
            if existing.is_active() {
                return Err(Error::integrity("TOTP method already active"));
            }
            self.store.delete_method(existing.id).await?;
        }

        let secret = Totp::generate_secret();
        let method = MfaMethod {
            id: MethodId::new(),
            user_id,
            method_type: MfaMethodType::Totp,
            secret: self.cipher.encrypt(secret.as_bytes())?,
            label: Some(label.to_string()),
            status: MfaMethodStatus::Pending,
            created_at: self.clock.now(),
            last_used_counter: None,
        };
        self.store.insert_method(&method).await?;

        let otpauth_url = self.totp.provisioning_uri(&self.realm, label, &secret);
        Ok(TotpEnrollment {
            method_id: method.id,
            secret,
            otpauth_url,
        })
    }

    /// Confirm TOTP enrollment with a current code
    pub async fn verify_totp_enrollment(
        &self,
        user_id: UserId,
        method_id: MethodId,
        code: &str,
    ) -> Result<()> {
        self.check_verify_limit(user_id, method_id).await?;

        let mut method = self
            .store
            .get_method(method_id)
            .await?
            .filter(|m| m.user_id == user_id && m.method_type == MfaMethodType::Totp)
            .ok_or(Error::MfaMethodNotFound)?;

        let secret = self.cipher.decrypt(&method.secret)?;
        let secret = String::from_utf8(secret).map_err(|_| Error::internal("corrupt secret"))?;

        let step = self
            .totp
            .verify(&secret, code, self.clock.now(), method.last_used_counter)?
            .ok_or(Error::InvalidMfaCode)?;

        method.status = MfaMethodStatus::Active;
        method.last_used_counter = Some(step);
        self.store.update_method(&method).await?;
        self.publish_activated(&method).await?;
        Ok(())
    }

    /// Start email enrollment; sends a one-time code to the address
    pub async fn enroll_email(&self, user_id: UserId, address: &str) -> Result<OobEnrollment> {
        self.enroll_oob(user_id, MfaMethodType::Email, address).await
    }

    /// Start SMS enrollment; sends a one-time code to the number
    pub async fn enroll_sms(&self, user_id: UserId, number: &str) -> Result<OobEnrollment> {
        self.enroll_oob(user_id, MfaMethodType::Sms, number).await
    }

    async fn enroll_oob(
        &self,
        user_id: UserId,
        method_type: MfaMethodType,
        contact: &str,
    ) -> Result<OobEnrollment> {
        if let Some(existing) = self.store.find_method(user_id, method_type).await? {
            if existing.is_active() {
                return Err(Error::integrity("method already active"));
            }
            self.store.delete_method(existing.id).await?;
        }

        let method = MfaMethod {
            id: MethodId::new(),
            user_id,
            method_type,
            secret: contact.as_bytes().to_vec(),
            label: None,
            status: MfaMethodStatus::Pending,
            created_at: self.clock.now(),
            last_used_counter: None,
        };
        self.store.insert_method(&method).await?;

        match self.issue_challenge(&method, true).await? {
            ChallengeOutcome::Success { challenge_id } => Ok(OobEnrollment {
                method_id: method.id,
                challenge_id,
            }),
            ChallengeOutcome::RateLimitExceeded { retry_after_secs }
            | ChallengeOutcome::Cooldown { retry_after_secs } => Err(Error::RateLimited {
                retry_after_secs,
            }),
            ChallengeOutcome::Failed { reason } => Err(Error::Sender { message: reason }),
        }
    }

    // === Challenges ===

    async fn issue_challenge(
        &self,
        method: &MfaMethod,
        for_enrollment: bool,
    ) -> Result<ChallengeOutcome> {
        let key = Self::rate_key(method.user_id, method.id);

        let cooldown = self
            .limiter
            .allow(SCOPE_SEND_COOLDOWN, &key, 1, self.config.send_cooldown)
            .await?;
        if let RateDecision::Denied { retry_after } = cooldown {
            return Ok(ChallengeOutcome::Cooldown {
                retry_after_secs: retry_after.num_seconds().max(0) as u64,
            });
        }

        let burst = self
            .limiter
            .allow(SCOPE_SEND, &key, self.config.send_limit, self.config.send_window)
            .await?;
        if let RateDecision::Denied { retry_after } = burst {
            return Ok(ChallengeOutcome::RateLimitExceeded {
                retry_after_secs: retry_after.num_seconds().max(0) as u64,
            });
        }

        let channel = method
            .method_type
            .channel()
            .ok_or_else(|| Error::internal("TOTP methods are not challenged"))?;
        let sender = self
            .senders
            .get(channel)
            .ok_or_else(|| Error::ExtensionNotConfigured {
                extension: format!("{channel} sender"),
            })?;

        let code = self.generate_code();
        let now = self.clock.now();
        let challenge = MfaChallenge {
            id: ChallengeId::new(),
            user_id: method.user_id,
            method_id: method.id,
            code_hash: Self::hash_code(&code),
            created_at: now,
            expires_at: now + self.config.challenge_ttl,
            consumed_at: None,
            for_enrollment,
        };
        self.store.insert_challenge(&challenge).await?;

        let recipient = method.contact()?;
        if let Err(e) = sender.send(&recipient, &code).await {
            // Outbound delivery is a soft failure; the challenge row stays
            // so a retried send can reuse the flow.
            tracing::warn!(
                realm = %self.realm,
                channel,
                error = %e,
                "Challenge delivery failed"
            );
            return Ok(ChallengeOutcome::Failed {
                reason: "delivery failed".to_string(),
            });
        }

        Ok(ChallengeOutcome::Success {
            challenge_id: challenge.id,
        })
    }

    /// Send a login challenge for an active out-of-band method
    pub async fn challenge(
        &self,
        user_id: UserId,
        method_id: MethodId,
        _device: Option<&DeviceInfo>,
    ) -> Result<ChallengeOutcome> {
        let method = self
            .store
            .get_method(method_id)
            .await?
            .filter(|m| m.user_id == user_id)
            .ok_or(Error::MfaMethodNotFound)?;

        if !method.is_active() {
            return Ok(ChallengeOutcome::Failed {
                reason: "method not active".to_string(),
            });
        }

        self.issue_challenge(&method, false).await
    }

    /// Verify a one-time challenge code
    pub async fn verify_challenge(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
        code: &str,
        device: Option<&DeviceInfo>,
    ) -> Result<()> {
        let challenge = self
            .store
            .get_challenge(challenge_id)
            .await?
            .filter(|c| c.user_id == user_id)
            .ok_or(Error::MfaChallengeNotFound)?;

        self.check_verify_limit(user_id, challenge.method_id).await?;

        let now = self.clock.now();
        if challenge.consumed_at.is_some() || now >= challenge.expires_at {
            return Err(Error::MfaChallengeNotFound);
        }

        let presented = Self::hash_code(code);
        let matches: bool = presented
            .as_bytes()
            .ct_eq(challenge.code_hash.as_bytes())
            .into();
        if !matches {
            return Err(Error::InvalidMfaCode);
        }

        if !self.store.consume_challenge(challenge_id, now).await? {
            return Err(Error::MfaChallengeNotFound);
        }

        if challenge.for_enrollment {
            let mut method = self
                .store
                .get_method(challenge.method_id)
                .await?
                .ok_or(Error::MfaMethodNotFound)?;
            method.status = MfaMethodStatus::Active;
            self.store.update_method(&method).await?;
            self.publish_activated(&method).await?;
        }

        self.maybe_trust_device(user_id, device).await?;
        Ok(())
    }

    /// Verify a TOTP code against an active method
    pub async fn verify_totp(
        &self,
        user_id: UserId,
        method_id: MethodId,
        code: &str,
        device: Option<&DeviceInfo>,
    ) -> Result<()> {
        self.check_verify_limit(user_id, method_id).await?;

        let mut method = self
            .store
            .get_method(method_id)
            .await?
            .filter(|m| m.user_id == user_id && m.method_type == MfaMethodType::Totp)
            .ok_or(Error::MfaMethodNotFound)?;

        if !method.is_active() {
            return Err(Error::MfaMethodNotFound);
        }

        let secret = self.cipher.decrypt(&method.secret)?;
        let secret = String::from_utf8(secret).map_err(|_| Error::internal("corrupt secret"))?;

        let step = self
            .totp
            .verify(&secret, code, self.clock.now(), method.last_used_counter)?
            .ok_or(Error::InvalidMfaCode)?;

        method.last_used_counter = Some(step);
        self.store.update_method(&method).await?;

        self.maybe_trust_device(user_id, device).await?;
        Ok(())
    }

    // === Backup codes ===

    /// Generate a fresh batch of backup codes, replacing any outstanding ones
    pub async fn generate_backup_codes(&self, user_id: UserId) -> Result<Vec<String>> {
        self.backup.generate(user_id).await
    }

    /// Spend a backup code; each verifies at most once
    pub async fn verify_backup_code(&self, user_id: UserId, code: &str) -> Result<()> {
        if self.backup.verify(user_id, code).await? {
            Ok(())
        } else {
            Err(Error::InvalidMfaCode)
        }
    }

    pub async fn remaining_backup_codes(&self, user_id: UserId) -> Result<usize> {
        self.backup.remaining(user_id).await
    }

    // === Trusted devices ===

    pub async fn trust_device(
        &self,
        user_id: UserId,
        ip: &str,
        user_agent: &str,
        name: Option<&str>,
        expires_in_days: Option<i64>,
    ) -> Result<()> {
        self.trusted
            .trust_device(user_id, ip, user_agent, name, expires_in_days)
            .await?;
        Ok(())
    }

    pub async fn is_device_trusted(
        &self,
        user_id: UserId,
        ip: &str,
        user_agent: &str,
    ) -> Result<bool> {
        self.trusted.is_device_trusted(user_id, ip, user_agent).await
    }

    pub async fn remove_all_trusted_devices(&self, user_id: UserId) -> Result<u64> {
        self.trusted.remove_all_devices(user_id).await
    }

    // === Queries ===

    /// Whether the user has at least one ACTIVE factor
    pub async fn has_active_method(&self, user_id: UserId) -> Result<bool> {
        Ok(self
            .store
            .list_methods(user_id)
            .await?
            .iter()
            .any(|m| m.is_active()))
    }

    /// Remove one of the caller's own methods
    pub async fn remove_method(&self, user_id: UserId, method_id: MethodId) -> Result<()> {
        let method = self
            .store
            .get_method(method_id)
            .await?
            .filter(|m| m.user_id == user_id)
            .ok_or(Error::MfaMethodNotFound)?;

        self.store.delete_method(method_id).await?;
        self.bus
            .publish(AuthEvent::new(
                &self.realm,
                EventData::MfaMethodRemoved {
                    user_id,
                    method_type: method.method_type.as_str().to_string(),
                },
            ))
            .await
    }

    // === Admin operations ===

    fn require_admin(actor_roles: &[String], action: &str) -> Result<()> {
        if actor_roles.iter().any(|r| r == ADMIN_ROLE) {
            Ok(())
        } else {
            Err(Error::forbidden(action))
        }
    }

    /// Remove any user's method; requires the ADMIN role
    pub async fn force_remove_method(
        &self,
        actor_roles: &[String],
        user_id: UserId,
        method_id: MethodId,
    ) -> Result<()> {
        Self::require_admin(actor_roles, "mfa.force_remove_method")?;
        self.remove_method(user_id, method_id).await
    }

    /// Strip all MFA state from a user; requires the ADMIN role
    pub async fn disable_mfa_for_user(
        &self,
        actor_roles: &[String],
        user_id: UserId,
    ) -> Result<()> {
        Self::require_admin(actor_roles, "mfa.disable_for_user")?;

        self.store.delete_all_for_user(user_id).await?;
        self.backup.remove_all(user_id).await?;
        self.trusted.remove_all_devices(user_id).await?;

        self.bus
            .publish(AuthEvent::new(
                &self.realm,
                EventData::MfaMethodRemoved {
                    user_id,
                    method_type: "ALL".to_string(),
                },
            ))
            .await
    }

    /// List any user's methods; requires the ADMIN role
    pub async fn list_user_methods(
        &self,
        actor_roles: &[String],
        user_id: UserId,
    ) -> Result<Vec<MfaMethod>> {
        Self::require_admin(actor_roles, "mfa.list_user_methods")?;
        self.store.list_methods(user_id).await
    }

    /// Strip a user's MFA state as part of account deletion (no actor check)
    pub async fn purge_user(&self, user_id: UserId) -> Result<()> {
        self.store.delete_all_for_user(user_id).await?;
        self.backup.remove_all(user_id).await?;
        self.trusted.remove_all_devices(user_id).await?;
        Ok(())
    }
}

/// In-memory MFA store
pub struct InMemoryMfaStore {
    methods: RwLock<HashMap<MethodId, MfaMethod>>,
    challenges: RwLock<HashMap<ChallengeId, MfaChallenge>>,
}

impl InMemoryMfaStore {
    pub fn new() -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
            challenges: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryMfaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MfaStore for InMemoryMfaStore {
    async fn insert_method(&self, method: &MfaMethod) -> Result<()> {
        let mut methods = self.methods.write();
        let duplicate = methods
            .values()
            .any(|m| m.user_id == method.user_id && m.method_type == method.method_type);
        if duplicate {
            return Err(Error::integrity("method type already enrolled for user"));
        }
        methods.insert(method.id, method.clone());
        Ok(())
    }

    async fn update_method(&self, method: &MfaMethod) -> Result<()> {
        self.methods.write().insert(method.id, method.clone());
        Ok(())
    }

    async fn delete_method(&self, id: MethodId) -> Result<()> {
        self.methods.write().remove(&id);
        Ok(())
    }

    async fn get_method(&self, id: MethodId) -> Result<Option<MfaMethod>> {
        Ok(self.methods.read().get(&id).cloned())
    }

    async fn find_method(
        &self,
        user_id: UserId,
        method_type: MfaMethodType,
    ) -> Result<Option<MfaMethod>> {
        Ok(self
            .methods
            .read()
            .values()
            .find(|m| m.user_id == user_id && m.method_type == method_type)
            .cloned())
    }

    async fn list_methods(&self, user_id: UserId) -> Result<Vec<MfaMethod>> {
        Ok(self
            .methods
            .read()
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn delete_all_for_user(&self, user_id: UserId) -> Result<u64> {
        let mut methods = self.methods.write();
        let before = methods.len();
        methods.retain(|_, m| m.user_id != user_id);
        Ok((before - methods.len()) as u64)
    }

    async fn insert_challenge(&self, challenge: &MfaChallenge) -> Result<()> {
        self.challenges
            .write()
            .insert(challenge.id, challenge.clone());
        Ok(())
    }

    async fn get_challenge(&self, id: ChallengeId) -> Result<Option<MfaChallenge>> {
        Ok(self.challenges.read().get(&id).cloned())
    }

    async fn consume_challenge(&self, id: ChallengeId, at: DateTime<Utc>) -> Result<bool> {
        let mut challenges = self.challenges.write();
        match challenges.get_mut(&id) {
            Some(challenge) if challenge.consumed_at.is_none() => {
                challenge.consumed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired_challenges(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut challenges = self.challenges.write();
        let before = challenges.len();
        challenges.retain(|_, c| c.expires_at > now);
        Ok((before - challenges.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_codes::InMemoryBackupCodeStore;
    use crate::rate_limit::SlidingWindowRateLimiter;
    use crate::secret::AesGcmCipher;
    use crate::trusted_device::InMemoryTrustedDeviceStore;
    use chrono::Duration;
    use parking_lot::Mutex;
    use realmgate_core::clock::Clock;
    use realmgate_core::clock::FixedClock;

    const UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
        AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    /// Captures sent codes instead of delivering them
    struct CapturingSender {
        channel: &'static str,
        sent: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl Sender for CapturingSender {
        fn channel(&self) -> &str {
            self.channel
        }

        async fn send(&self, recipient: &str, code: &str) -> Result<()> {
            self.sent
                .lock()
                .push((recipient.to_string(), code.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        engine: MfaEngine<InMemoryMfaStore, InMemoryTrustedDeviceStore, InMemoryBackupCodeStore>,
        clock: FixedClock,
        sent: Arc<Mutex<Vec<(String, String)>>>,
        bus: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let clock = FixedClock::for_tests();
        let bus = Arc::new(EventBus::new("acme"));
        let sent = Arc::new(Mutex::new(Vec::new()));

        let mut senders: HashMap<String, Arc<dyn Sender>> = HashMap::new();
        senders.insert(
            "email".to_string(),
            Arc::new(CapturingSender {
                channel: "email",
                sent: sent.clone(),
            }),
        );
        senders.insert(
            "sms".to_string(),
            Arc::new(CapturingSender {
                channel: "sms",
                sent: sent.clone(),
            }),
        );

        let config = MfaConfig {
            encryption_key: vec![9u8; 32],
            ..Default::default()
        };
        let shared_clock = Arc::new(clock.clone());
        let engine = MfaEngine::new(
            "acme",
            config.clone(),
            Arc::new(InMemoryMfaStore::new()),
            Arc::new(InMemoryTrustedDeviceStore::new()),
            Arc::new(InMemoryBackupCodeStore::new()),
            Arc::new(SlidingWindowRateLimiter::new(shared_clock.clone())),
            Arc::new(AesGcmCipher::new(&config.encryption_key).unwrap()),
            senders,
            shared_clock,
            bus.clone(),
        )
        .unwrap();

        Fixture {
            engine,
            clock,
            sent,
            bus,
        }
    }

    fn totp_code_for(enrollment: &TotpEnrollment, at: DateTime<Utc>) -> String {
        Totp::default().code_at(&enrollment.secret, at).unwrap()
    }

    #[tokio::test]
    async fn test_totp_enrollment_flow() {
        let f = fixture();
        let user_id = UserId::new();

        let enrollment = f.engine.enroll_totp(user_id, "user@example.com").await.unwrap();
        assert!(enrollment.otpauth_url.starts_with("otpauth://totp/"));
        assert!(!f.engine.has_active_method(user_id).await.unwrap());

        let code = totp_code_for(&enrollment, f.clock.now());
        f.engine
            .verify_totp_enrollment(user_id, enrollment.method_id, &code)
            .await
            .unwrap();

        assert!(f.engine.has_active_method(user_id).await.unwrap());
        f.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_totp_wrong_code_keeps_method_pending() {
        let f = fixture();
        let user_id = UserId::new();
        let enrollment = f.engine.enroll_totp(user_id, "user@example.com").await.unwrap();

        let result = f
            .engine
            .verify_totp_enrollment(user_id, enrollment.method_id, "000000")
            .await;
        // Either invalid (overwhelmingly likely) or the 1-in-a-million collision.
        if result.is_err() {
            assert!(!f.engine.has_active_method(user_id).await.unwrap());
        }
        f.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_totp_step_reuse_rejected() {
        let f = fixture();
        let user_id = UserId::new();
        let enrollment = f.engine.enroll_totp(user_id, "user@example.com").await.unwrap();

        let code = totp_code_for(&enrollment, f.clock.now());
        f.engine
            .verify_totp_enrollment(user_id, enrollment.method_id, &code)
            .await
            .unwrap();

        // The same step cannot verify again.
        let replay = f
            .engine
            .verify_totp(user_id, enrollment.method_id, &code, None)
            .await;
        assert!(matches!(replay, Err(Error::InvalidMfaCode)));

        // The next step verifies.
        f.clock.advance(Duration::seconds(30));
        let next = totp_code_for(&enrollment, f.clock.now());
        f.engine
            .verify_totp(user_id, enrollment.method_id, &next, None)
            .await
            .unwrap();
        f.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_email_enrollment_flow() {
        let f = fixture();
        let user_id = UserId::new();

        let enrollment = f
            .engine
            .enroll_email(user_id, "user@example.com")
            .await
            .unwrap();

        let (recipient, code) = f.sent.lock().last().cloned().unwrap();
        assert_eq!(recipient, "user@example.com");
        assert_eq!(code.len(), 6);

        f.engine
            .verify_challenge(user_id, enrollment.challenge_id, &code, None)
            .await
            .unwrap();
        assert!(f.engine.has_active_method(user_id).await.unwrap());

        // A consumed challenge cannot be replayed.
        let replay = f
            .engine
            .verify_challenge(user_id, enrollment.challenge_id, &code, None)
            .await;
        assert!(replay.is_err());
        f.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_challenge_cooldown_and_burst() {
        let f = fixture();
        let user_id = UserId::new();

        let enrollment = f
            .engine
            .enroll_email(user_id, "user@example.com")
            .await
            .unwrap();
        let (_, code) = f.sent.lock().last().cloned().unwrap();
        f.engine
            .verify_challenge(user_id, enrollment.challenge_id, &code, None)
            .await
            .unwrap();

        // Immediate re-send is in cooldown.
        let outcome = f
            .engine
            .challenge(user_id, enrollment.method_id, None)
            .await
            .unwrap();
        assert!(matches!(outcome, ChallengeOutcome::Cooldown { .. }));

        // After the cooldown, sends pass until the burst window is exhausted.
        let mut successes = 0;
        loop {
            f.clock.advance(Duration::seconds(61));
            match f
                .engine
                .challenge(user_id, enrollment.method_id, None)
                .await
                .unwrap()
            {
                ChallengeOutcome::Success { .. } => successes += 1,
                ChallengeOutcome::RateLimitExceeded { retry_after_secs } => {
                    assert!(retry_after_secs > 0);
                    break;
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
            assert!(successes <= 5, "burst limit never applied");
        }
        // One send was spent during enrollment.
        assert_eq!(successes, 4);
        f.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_verify_rate_limit() {
        let f = fixture();
        let user_id = UserId::new();
        let enrollment = f.engine.enroll_totp(user_id, "user@example.com").await.unwrap();

        for _ in 0..5 {
            let _ = f
                .engine
                .verify_totp_enrollment(user_id, enrollment.method_id, "000000")
                .await;
        }

        let sixth = f
            .engine
            .verify_totp_enrollment(user_id, enrollment.method_id, "000000")
            .await;
        assert!(matches!(sixth, Err(Error::RateLimited { .. })));
        f.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_remember_device_trusts_fingerprint() {
        let f = fixture();
        let user_id = UserId::new();
        let enrollment = f
            .engine
            .enroll_email(user_id, "user@example.com")
            .await
            .unwrap();
        let (_, code) = f.sent.lock().last().cloned().unwrap();

        let device = DeviceInfo {
            ip: "10.0.0.1".to_string(),
            user_agent: UA.to_string(),
            remember_device: true,
            device_name: None,
        };
        f.engine
            .verify_challenge(user_id, enrollment.challenge_id, &code, Some(&device))
            .await
            .unwrap();

        assert!(f
            .engine
            .is_device_trusted(user_id, "10.0.0.1", UA)
            .await
            .unwrap());

        f.engine.remove_all_trusted_devices(user_id).await.unwrap();
        assert!(!f
            .engine
            .is_device_trusted(user_id, "10.0.0.1", UA)
            .await
            .unwrap());
        f.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_backup_codes_consume_once() {
        let f = fixture();
        let user_id = UserId::new();

        let codes = f.engine.generate_backup_codes(user_id).await.unwrap();
        f.engine.verify_backup_code(user_id, &codes[0]).await.unwrap();

        let again = f.engine.verify_backup_code(user_id, &codes[0]).await;
        assert!(matches!(again, Err(Error::InvalidMfaCode)));
        f.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_admin_operations_require_role() {
        let f = fixture();
        let user_id = UserId::new();
        f.engine.enroll_totp(user_id, "user@example.com").await.unwrap();

        let no_roles: Vec<String> = vec![];
        let admin = vec![ADMIN_ROLE.to_string()];

        assert!(matches!(
            f.engine.list_user_methods(&no_roles, user_id).await,
            Err(Error::InsufficientPermissions { .. })
        ));

        let methods = f.engine.list_user_methods(&admin, user_id).await.unwrap();
        assert_eq!(methods.len(), 1);

        f.engine.disable_mfa_for_user(&admin, user_id).await.unwrap();
        assert!(f
            .engine
            .list_user_methods(&admin, user_id)
            .await
            .unwrap()
            .is_empty());
        f.bus.shutdown().await;
    }
}
