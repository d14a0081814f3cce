//! # Realmgate Core
//!
//! Core types, traits, and interfaces for the Realmgate identity platform.
//! This crate defines the shared abstractions used across the system:
//! the unified error type, per-realm configuration, the clock and id
//! primitives, the lifecycle hook registry, and the realm-scoped service
//! table.

pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod hook;
pub mod id;
pub mod interfaces;
pub mod realm;
pub mod service;

// Re-exports for convenience
pub use clock::{Clock, FixedClock, SharedClock, SystemClock};
pub use config::{
    AnomalyDetectionConfig, AuditConfig, HookFailureStrategy, LockoutPolicy, MfaConfig,
    PasswordHashingConfig, RealmConfig, SessionConfig, TokenConfig, TokenRotation, TokenType,
    TokenValidity,
};
pub use error::{Error, Result};
pub use hook::{HookContext, HookKind, HookRegistry, HookReport, LifecycleHook, Priority};
pub use id::{
    AttemptId, AuditId, ChallengeId, DeviceId, MethodId, SessionId, TokenFamily, TokenId, UserId,
};
pub use interfaces::{GeoLocation, GeoLookup, Hasher, SecretCipher, Sender};
pub use realm::{Realm, RealmDescriptor};
pub use service::{Service, ServiceTable};

/// The current version of Realmgate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
