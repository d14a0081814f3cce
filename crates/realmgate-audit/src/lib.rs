//! # Realmgate Audit
//!
//! Append-only audit trail: a non-blocking bounded queue feeding a
//! background batcher, metadata sanitization on write, filtered queries,
//! JSON/CSV export, and retention-based pruning.

pub mod event;
pub mod export;
pub mod pipeline;
pub mod sanitize;
pub mod store;

pub use event::{ActorType, AuditEvent, AuditFilter, AuditResult};
pub use export::{export, ExportFormat};
pub use pipeline::AuditPipeline;
pub use sanitize::{escape_html, is_sensitive_key, sanitize_metadata};
pub use store::{AuditStore, InMemoryAuditStore};
