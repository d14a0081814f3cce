//! Sliding-window rate limiting.
//!
//! Counters are keyed by `(scope, key)` so one limiter instance can serve
//! every caller in a realm: MFA verification, challenge sends, and anything
//! an extension brings along.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use realmgate_core::clock::SharedClock;
use realmgate_core::error::Result;
use std::collections::HashMap;

/// Outcome of a rate-limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn retry_after_secs(&self) -> u64 {
        match self {
            Self::Allowed { .. } => 0,
            Self::Denied { retry_after } => retry_after.num_seconds().max(0) as u64,
        }
    }
}

/// Sliding-window counter per `(scope, key)`
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record an attempt if the window has room; deny with a retry hint otherwise
    async fn allow(
        &self,
        scope: &str,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision>;

    /// Check without recording
    async fn peek(
        &self,
        scope: &str,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision>;

    /// Drop all state for a `(scope, key)`
    async fn reset(&self, scope: &str, key: &str) -> Result<()>;
}

/// In-memory sliding-window limiter
pub struct SlidingWindowRateLimiter {
    clock: SharedClock,
    entries: Mutex<HashMap<(String, String), Vec<DateTime<Utc>>>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn decide(
        timestamps: &mut Vec<DateTime<Utc>>,
        now: DateTime<Utc>,
        limit: u32,
        window: Duration,
        record: bool,
    ) -> RateDecision {
        timestamps.retain(|t| *t > now - window);

        if timestamps.len() >= limit as usize {
            let oldest = timestamps.first().copied().unwrap_or(now);
            return RateDecision::Denied {
                retry_after: (oldest + window) - now,
            };
        }

        if record {
            timestamps.push(now);
        }
        RateDecision::Allowed {
            remaining: limit - timestamps.len() as u32,
        }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn allow(
        &self,
        scope: &str,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let timestamps = entries
            .entry((scope.to_string(), key.to_string()))
            .or_default();
        Ok(Self::decide(timestamps, now, limit, window, true))
    }

    async fn peek(
        &self,
        scope: &str,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let timestamps = entries
            .entry((scope.to_string(), key.to_string()))
            .or_default();
        Ok(Self::decide(timestamps, now, limit, window, false))
    }

    async fn reset(&self, scope: &str, key: &str) -> Result<()> {
        self.entries
            .lock()
            .remove(&(scope.to_string(), key.to_string()));
        Ok(())
    }
}
