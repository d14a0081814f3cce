//! # Realmgate Users
//!
//! User and role management for one realm: credential storage, uniqueness
//! constraints, idempotent role membership, and self-service password
//! recovery tokens.

pub mod recovery;
pub mod service;
pub mod user;

pub use recovery::{
    InMemoryResetTokenStore, RecoveryConfig, RecoveryManager, ResetToken, ResetTokenStore,
};
pub use service::{NewUser, UserService, UserUpdate};
pub use user::{InMemoryUserStore, Role, User, UserStatus, UserStore};
