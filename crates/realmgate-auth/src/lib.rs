//! # Realmgate Auth
//!
//! The security engines of the platform:
//!
//! - **Token lifecycle**: JWT issuance and verification, refresh rotation
//!   with grace periods and family-wide replay revocation
//! - **Lockout**: sliding-window failure counting per identifier and IP,
//!   timed and indefinite account locks
//! - **MFA**: TOTP and out-of-band factor enrollment/verification, trusted
//!   devices, backup codes, rate-limited throughout
//! - **Primitives**: Argon2id password hashing, AES-256-GCM secret
//!   encryption, sliding-window rate limiting

pub mod backup_codes;
pub mod jwt;
pub mod lockout;
pub mod mfa;
pub mod password;
pub mod rate_limit;
pub mod secret;
pub mod tokens;
pub mod totp;
pub mod trusted_device;

// Re-exports for convenience
pub use backup_codes::{BackupCodeManager, BackupCodeStore, InMemoryBackupCodeStore, MfaBackupCode};
pub use jwt::{Claims, JwtKeyring, Principal};
pub use lockout::{
    AccountLock, FailedAttempt, InMemoryLockoutStore, LockDecision, LockoutEngine, LockoutStore,
    ThrottleDecision,
};
pub use mfa::{
    ChallengeOutcome, DeviceInfo, InMemoryMfaStore, MfaChallenge, MfaEngine, MfaMethod,
    MfaMethodStatus, MfaMethodType, MfaStore, OobEnrollment, TotpEnrollment, ADMIN_ROLE,
};
pub use password::Argon2Hasher;
pub use rate_limit::{RateDecision, RateLimiter, SlidingWindowRateLimiter};
pub use secret::AesGcmCipher;
pub use tokens::{
    InMemoryTokenStore, IssueContext, RoleSource, RotationOutcome, StoredToken, TokenEngine,
    TokenPair, TokenStore,
};
pub use totp::{Totp, TotpConfig};
pub use trusted_device::{
    InMemoryTrustedDeviceStore, MfaTrustedDevice, TrustedDeviceManager, TrustedDeviceStore,
};
