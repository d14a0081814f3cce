//! # Realmgate Sessions
//!
//! Session tracking driven by token events: one session per active token
//! family, concurrency caps with oldest-first eviction, device and location
//! anomaly detection, and a cancellable background loop that expires,
//! archives and prunes.

pub mod anomaly;
pub mod cleanup;
pub mod engine;
pub mod session;

pub use anomaly::{haversine_km, AnomalyDetector, PriorFootprint};
pub use cleanup::CleanupTask;
pub use engine::{CleanupStats, SessionEngine, REASON_MAX_SESSIONS};
pub use session::{
    InMemorySessionStore, Session, SessionHistoryEntry, SessionStatus, SessionStore,
};
