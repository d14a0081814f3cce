//! Per-realm configuration.
//!
//! Every engine is constructed from one of these sections; nothing reads
//! configuration globally. Defaults mirror what the platform ships with when a
//! realm omits a section.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Token type carried in the `type` claim and used to key persistence policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

/// How hook failures affect the surrounding operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookFailureStrategy {
    /// Abort the operation and surface the first error
    FailFast,
    /// Log and continue; report a composite failure list at the end
    #[default]
    Continue,
}

/// Token validity per type
#[derive(Debug, Clone)]
pub struct TokenValidity {
    pub access: Duration,
    pub refresh: Duration,
}

impl Default for TokenValidity {
    fn default() -> Self {
        Self {
            access: Duration::hours(2),
            refresh: Duration::days(90),
        }
    }
}

impl TokenValidity {
    pub fn for_type(&self, token_type: TokenType) -> Duration {
        match token_type {
            TokenType::Access => self.access,
            TokenType::Refresh => self.refresh,
        }
    }
}

/// Refresh-token rotation policy
#[derive(Debug, Clone)]
pub struct TokenRotation {
    /// When false, refresh mints a new pair without revoking the old one
    pub enabled: bool,
    /// Window after first use during which re-presentation is an idempotent retry
    pub grace_period: Duration,
    /// Revoke the whole family when a consumed token is replayed past the grace period
    pub revoke_family_on_replay: bool,
}

impl Default for TokenRotation {
    fn default() -> Self {
        Self {
            enabled: true,
            grace_period: Duration::seconds(30),
            revoke_family_on_replay: true,
        }
    }
}

/// Token engine configuration
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Signing secrets; the last entry signs, all entries verify (key id =
    /// index). Rotate by appending so earlier indices stay stable.
    pub secrets: Vec<String>,
    pub issuer: String,
    pub audience: String,
    pub validity: TokenValidity,
    /// Which token types get their hash persisted
    pub persistence: HashMap<TokenType, bool>,
    pub rotation: TokenRotation,
}

impl Default for TokenConfig {
    fn default() -> Self {
        let mut persistence = HashMap::new();
        persistence.insert(TokenType::Refresh, true);
        Self {
            secrets: vec!["change-me-in-production".to_string()],
            issuer: "realmgate".to_string(),
            audience: "realmgate".to_string(),
            validity: TokenValidity::default(),
            persistence,
            rotation: TokenRotation::default(),
        }
    }
}

impl TokenConfig {
    pub fn persist(&self, token_type: TokenType) -> bool {
        self.persistence.get(&token_type).copied().unwrap_or(false)
    }

    pub fn validate(&self) -> Result<()> {
        if self.secrets.is_empty() {
            return Err(Error::configuration("token secrets must not be empty"));
        }
        Ok(())
    }
}

/// Account lockout policy
#[derive(Debug, Clone)]
pub struct LockoutPolicy {
    pub max_failed_attempts: u32,
    pub attempt_window: Duration,
    pub lockout_duration: Duration,
    pub enabled: bool,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self::moderate()
    }
}

impl LockoutPolicy {
    pub fn strict() -> Self {
        Self {
            max_failed_attempts: 3,
            attempt_window: Duration::minutes(15),
            lockout_duration: Duration::hours(1),
            enabled: true,
        }
    }

    pub fn moderate() -> Self {
        Self {
            max_failed_attempts: 5,
            attempt_window: Duration::minutes(15),
            lockout_duration: Duration::minutes(30),
            enabled: true,
        }
    }

    pub fn lenient() -> Self {
        Self {
            max_failed_attempts: 10,
            attempt_window: Duration::minutes(30),
            lockout_duration: Duration::minutes(15),
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            max_failed_attempts: u32::MAX,
            attempt_window: Duration::minutes(15),
            lockout_duration: Duration::zero(),
            enabled: false,
        }
    }

    /// IP-scoped threshold is a fixed multiple of the identifier threshold
    pub fn ip_threshold(&self) -> u32 {
        self.max_failed_attempts.saturating_mul(4)
    }
}

/// Password hashing parameters (Argon2id)
#[derive(Debug, Clone)]
pub struct PasswordHashingConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordHashingConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Anomaly detection toggles for session creation
#[derive(Debug, Clone)]
pub struct AnomalyDetectionConfig {
    pub detect_new_device: bool,
    pub detect_new_location: bool,
    /// Minimum great-circle distance (km) from every prior session before a
    /// location counts as new
    pub location_radius_km: f64,
}

impl Default for AnomalyDetectionConfig {
    fn default() -> Self {
        Self {
            detect_new_device: true,
            detect_new_location: true,
            location_radius_km: 100.0,
        }
    }
}

/// Session engine configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_concurrent_sessions: usize,
    pub session_expiration: Duration,
    pub session_history_retention: Duration,
    pub cleanup_interval: Duration,
    pub anomaly_detection: AnomalyDetectionConfig,
    /// Whether session rows carry geolocation from the realm's lookup
    pub geo_location_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 5,
            session_expiration: Duration::hours(24),
            session_history_retention: Duration::days(90),
            cleanup_interval: Duration::minutes(5),
            anomaly_detection: AnomalyDetectionConfig::default(),
            geo_location_enabled: true,
        }
    }
}

/// MFA engine configuration
#[derive(Debug, Clone)]
pub struct MfaConfig {
    /// Gate token issuance on a verified MFA factor
    pub require_mfa: bool,
    /// AES-256-GCM key for stored TOTP secrets
    pub encryption_key: Vec<u8>,
    /// One-time challenge code length (digits)
    pub code_length: usize,
    /// One-time challenge lifetime
    pub challenge_ttl: Duration,
    /// Verification attempts per (user, method) per window
    pub verify_limit: u32,
    pub verify_window: Duration,
    /// Challenge sends per (user, method) per window, plus per-send cooldown
    pub send_limit: u32,
    pub send_window: Duration,
    pub send_cooldown: Duration,
    /// Default trusted-device lifetime in days (None = no expiry)
    pub trusted_device_days: Option<i64>,
    /// Backup codes generated per batch
    pub backup_code_count: usize,
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self {
            require_mfa: false,
            encryption_key: vec![0u8; 32],
            code_length: 6,
            challenge_ttl: Duration::minutes(5),
            verify_limit: 5,
            verify_window: Duration::minutes(15),
            send_limit: 5,
            send_window: Duration::minutes(15),
            send_cooldown: Duration::seconds(60),
            trusted_device_days: Some(30),
            backup_code_count: 10,
        }
    }
}

impl MfaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.encryption_key.len() != 32 {
            return Err(Error::configuration(
                "mfa encryption key must be 32 bytes (AES-256-GCM)",
            ));
        }
        Ok(())
    }
}

/// Audit pipeline configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retention_period: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: 4096,
            batch_size: 100,
            flush_interval: Duration::seconds(5),
            retention_period: Duration::days(365),
        }
    }
}

/// Full per-realm configuration
#[derive(Debug, Clone)]
pub struct RealmConfig {
    pub token: TokenConfig,
    pub account_lockout: LockoutPolicy,
    pub password_hashing: PasswordHashingConfig,
    pub session: SessionConfig,
    pub mfa: MfaConfig,
    pub audit: AuditConfig,
    pub hook_failure_strategy: HookFailureStrategy,
    /// Display time zone; storage is always UTC
    pub time_zone: chrono_tz::Tz,
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            token: TokenConfig::default(),
            account_lockout: LockoutPolicy::default(),
            password_hashing: PasswordHashingConfig::default(),
            session: SessionConfig::default(),
            mfa: MfaConfig::default(),
            audit: AuditConfig::default(),
            hook_failure_strategy: HookFailureStrategy::default(),
            time_zone: chrono_tz::Tz::UTC,
        }
    }
}

impl RealmConfig {
    pub fn validate(&self) -> Result<()> {
        self.token.validate()?;
        self.mfa.validate()?;
        if self.session.max_concurrent_sessions == 0 {
            return Err(Error::configuration(
                "max_concurrent_sessions must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validity() {
        let v = TokenValidity::default();
        assert_eq!(v.for_type(TokenType::Access), Duration::hours(2));
        assert_eq!(v.for_type(TokenType::Refresh), Duration::days(90));
    }

    #[test]
    fn test_default_persistence_refresh_only() {
        let config = TokenConfig::default();
        assert!(config.persist(TokenType::Refresh));
        assert!(!config.persist(TokenType::Access));
    }

    #[test]
    fn test_lockout_presets() {
        let strict = LockoutPolicy::strict();
        assert_eq!(strict.max_failed_attempts, 3);
        assert_eq!(strict.lockout_duration, Duration::hours(1));
        assert_eq!(strict.ip_threshold(), 12);

        assert!(!LockoutPolicy::disabled().enabled);
    }

    #[test]
    fn test_validation_rejects_empty_secrets() {
        let config = TokenConfig {
            secrets: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_short_mfa_key() {
        let config = MfaConfig {
            encryption_key: vec![0u8; 16],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
