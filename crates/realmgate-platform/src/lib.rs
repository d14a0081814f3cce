//! # Realmgate Platform
//!
//! The composition layer: one `RealmOrchestrator` per realm wires the token,
//! lockout, MFA, session and audit engines over a shared event bus, hook
//! registry and service table, and exposes the authentication, session,
//! admin and self-service APIs. Extensions attach per realm and register
//! hooks, subscribers and services.

pub mod admin;
pub mod authentication;
pub mod extension;
pub mod mirror;
pub mod orchestrator;
pub mod stores;

pub use authentication::{LoginRequest, LoginResponse, MfaProof, RequestContext};
pub use extension::{Extension, RealmHandle};
pub use mirror::{register_audit_mirror, to_audit_event};
pub use orchestrator::{RealmCollaborators, RealmOrchestrator};
pub use stores::RealmStores;
