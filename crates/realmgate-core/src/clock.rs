//! Clock abstraction.
//!
//! Every engine receives its clock by construction so time-dependent behavior
//! (token expiry, sliding windows, timed locks) is testable without sleeping.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Source of "now" for all engines
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System clock backed by `Utc::now`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests
#[derive(Clone)]
pub struct FixedClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Deterministic start placed ahead of wall-clock time. Signature
    /// libraries check token expiry against the real clock, so tokens minted
    /// under this clock must not already be expired in real time.
    pub fn for_tests() -> Self {
        Self::new(DateTime::<Utc>::from_timestamp(4_102_444_800, 0).unwrap())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Convenience constructor for the default clock
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
