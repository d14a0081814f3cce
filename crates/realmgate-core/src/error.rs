//! Unified error types for Realmgate using thiserror.
//!
//! Every engine in the workspace returns this error type. Authentication and
//! token paths must never leak storage details or credential material through
//! these messages; constructors below keep the caller-visible text generic.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// The unified error type for Realmgate operations
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors
    #[error("Email already exists in this realm")]
    EmailAlreadyExists,

    #[error("Phone number already exists in this realm")]
    PhoneAlreadyExists,

    #[error("Role not found: {name}")]
    RoleNotFound { name: String },

    #[error("User not found")]
    UserNotFound,

    #[error("User update failed: {message}")]
    UserUpdateFailed { message: String },

    // Authorization errors
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Suspicious token presented")]
    SuspiciousToken,

    #[error("Invalid token: {reason}")]
    InvalidToken { reason: String },

    #[error("Token expired")]
    TokenExpired,

    #[error("User has no roles assigned")]
    UserHasNoRoles,

    #[error("Account is not verified")]
    UnverifiedAccount,

    #[error("Account is locked")]
    AccountLocked {
        locked_until: Option<DateTime<Utc>>,
        reason: String,
    },

    #[error("Refresh token replay detected for family {token_family}")]
    TokenReplayDetected {
        token_family: Uuid,
        original_token_id: Uuid,
    },

    #[error("Insufficient permissions for {action}")]
    InsufficientPermissions { action: String },

    // MFA errors
    #[error("MFA method not found")]
    MfaMethodNotFound,

    #[error("MFA challenge not found or expired")]
    MfaChallengeNotFound,

    #[error("Invalid MFA code")]
    InvalidMfaCode,

    #[error("MFA is required for this realm")]
    MfaRequired,

    // Database errors
    #[error("Database integrity violation: {message}")]
    Integrity { message: String },

    #[error("Database connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Database access error: {message}")]
    Access { message: String },

    #[error("Database error: {message}")]
    Database { message: String },

    // Configuration errors
    #[error("Realm not found: {realm}")]
    RealmNotFound { realm: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Extension not configured: {extension}")]
    ExtensionNotConfigured { extension: String },

    // Hook errors
    #[error("Hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    #[error("{failed} of {total} hooks failed for '{hook}'")]
    HookComposite {
        hook: String,
        failed: usize,
        total: usize,
    },

    // Rate limiting
    #[error("Rate limit exceeded: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    // Outbound collaborators
    #[error("Sender error: {message}")]
    Sender { message: String },

    // Shutdown
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    // Generic wrapped error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Error::Database {
            message: message.into(),
        }
    }

    /// Create an integrity-violation error
    pub fn integrity(message: impl Into<String>) -> Self {
        Error::Integrity {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid-token error
    pub fn invalid_token(reason: impl Into<String>) -> Self {
        Error::InvalidToken {
            reason: reason.into(),
        }
    }

    /// Create an insufficient-permissions error
    pub fn forbidden(action: impl Into<String>) -> Self {
        Error::InsufficientPermissions {
            action: action.into(),
        }
    }

    /// Whether retrying the same operation can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::Database { .. } | Error::RateLimited { .. }
        )
    }

    /// Whether the error terminates the presented token family
    pub fn is_replay(&self) -> bool {
        matches!(self, Error::TokenReplayDetected { .. })
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::UserNotFound | Error::RoleNotFound { .. } | Error::MfaMethodNotFound => 404,
            Error::InvalidCredentials
            | Error::SuspiciousToken
            | Error::InvalidToken { .. }
            | Error::TokenExpired
            | Error::InvalidMfaCode
            | Error::MfaChallengeNotFound
            | Error::UnverifiedAccount => 401,
            Error::AccountLocked { .. }
            | Error::TokenReplayDetected { .. }
            | Error::InsufficientPermissions { .. }
            | Error::UserHasNoRoles
            | Error::MfaRequired => 403,
            Error::EmailAlreadyExists | Error::PhoneAlreadyExists | Error::Integrity { .. } => 409,
            Error::UserUpdateFailed { .. } => 400,
            Error::RateLimited { .. } => 429,
            Error::ShutdownInProgress => 503,
            _ => 500,
        }
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::EmailAlreadyExists => "EMAIL_EXISTS",
            Error::PhoneAlreadyExists => "PHONE_EXISTS",
            Error::RoleNotFound { .. } => "ROLE_NOT_FOUND",
            Error::UserNotFound => "USER_NOT_FOUND",
            Error::UserUpdateFailed { .. } => "USER_UPDATE_FAILED",
            Error::InvalidCredentials => "INVALID_CREDENTIALS",
            Error::SuspiciousToken => "SUSPICIOUS_TOKEN",
            Error::InvalidToken { .. } => "INVALID_TOKEN",
            Error::TokenExpired => "TOKEN_EXPIRED",
            Error::UserHasNoRoles => "NO_ROLES",
            Error::UnverifiedAccount => "UNVERIFIED_ACCOUNT",
            Error::AccountLocked { .. } => "ACCOUNT_LOCKED",
            Error::TokenReplayDetected { .. } => "TOKEN_REPLAY",
            Error::InsufficientPermissions { .. } => "FORBIDDEN",
            Error::MfaMethodNotFound => "MFA_METHOD_NOT_FOUND",
            Error::MfaChallengeNotFound => "MFA_CHALLENGE_NOT_FOUND",
            Error::InvalidMfaCode => "INVALID_MFA_CODE",
            Error::MfaRequired => "MFA_REQUIRED",
            Error::Integrity { .. } => "DB_INTEGRITY",
            Error::Connection { .. } => "DB_CONNECTION",
            Error::Access { .. } => "DB_ACCESS",
            Error::Database { .. } => "DB_ERROR",
            Error::RealmNotFound { .. } => "REALM_NOT_FOUND",
            Error::Configuration { .. } => "CONFIG_ERROR",
            Error::ExtensionNotConfigured { .. } => "EXTENSION_NOT_CONFIGURED",
            Error::Hook { .. } => "HOOK_ERROR",
            Error::HookComposite { .. } => "HOOK_COMPOSITE",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::Sender { .. } => "SENDER_ERROR",
            Error::ShutdownInProgress => "SHUTDOWN",
            Error::Internal { .. } => "INTERNAL_ERROR",
            Error::Other(_) => "UNKNOWN_ERROR",
        }
    }
}

/// Result type alias for Realmgate operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(Error::InvalidCredentials.status_code(), 401);
        assert_eq!(Error::EmailAlreadyExists.status_code(), 409);
        assert_eq!(
            Error::AccountLocked {
                locked_until: None,
                reason: "too many attempts".into(),
            }
            .status_code(),
            403
        );
        assert_eq!(
            Error::RateLimited {
                retry_after_secs: 60
            }
            .status_code(),
            429
        );
    }

    #[test]
    fn test_replay_classification() {
        let err = Error::TokenReplayDetected {
            token_family: Uuid::now_v7(),
            original_token_id: Uuid::now_v7(),
        };
        assert!(err.is_replay());
        assert!(!Error::InvalidCredentials.is_replay());
    }

    #[test]
    fn test_messages_do_not_leak_detail() {
        // Unknown user and bad password both collapse to the same message.
        assert_eq!(Error::InvalidCredentials.to_string(), "Invalid credentials");
        assert_eq!(Error::UserNotFound.to_string(), "User not found");
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::database("connection reset").is_retryable());
        assert!(!Error::InvalidCredentials.is_retryable());
    }
}
