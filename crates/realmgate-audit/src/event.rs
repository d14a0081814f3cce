//! Audit event model and query filters.
//!
//! Rows are append-only: once written they are never mutated, only pruned by
//! retention.

use chrono::{DateTime, Utc};
use realmgate_core::id::AuditId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Who performed the audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActorType {
    User,
    Admin,
    System,
    Anonymous,
}

/// Outcome of the audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditResult {
    Success,
    Failure,
    PartialSuccess,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::PartialSuccess => "PARTIAL_SUCCESS",
        }
    }
}

/// An immutable audit row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: AuditId,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub actor_id: Option<String>,
    pub actor_type: ActorType,
    pub target_id: Option<String>,
    pub target_type: Option<String>,
    pub result: AuditResult,
    /// Sanitized on write; ordered for stable export
    pub metadata: BTreeMap<String, Value>,
    pub realm: String,
    pub session_id: Option<String>,
}

impl AuditEvent {
    pub fn new(
        realm: impl Into<String>,
        event_type: impl Into<String>,
        actor_type: ActorType,
        result: AuditResult,
    ) -> Self {
        Self {
            id: AuditId::new(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            actor_id: None,
            actor_type,
            target_id: None,
            target_type: None,
            result,
            metadata: BTreeMap::new(),
            realm: realm.into(),
            session_id: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_target(
        mut self,
        target_id: impl Into<String>,
        target_type: impl Into<String>,
    ) -> Self {
        self.target_id = Some(target_id.into());
        self.target_type = Some(target_type.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }
}

/// Query filter; every populated field narrows the result
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_types: Option<Vec<String>>,
    pub actor_id: Option<String>,
    pub target_id: Option<String>,
    pub result: Option<AuditResult>,
    pub realm: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(actor) = &self.actor_id {
            if event.actor_id.as_ref() != Some(actor) {
                return false;
            }
        }
        if let Some(target) = &self.target_id {
            if event.target_id.as_ref() != Some(target) {
                return false;
            }
        }
        if let Some(result) = self.result {
            if event.result != result {
                return false;
            }
        }
        if let Some(realm) = &self.realm {
            if &event.realm != realm {
                return false;
            }
        }
        if let Some(from) = self.from {
            if event.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.timestamp > to {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matching() {
        let event = AuditEvent::new("acme", "login.success", ActorType::User, AuditResult::Success)
            .with_actor("user-1");

        assert!(AuditFilter::default().matches(&event));
        assert!(AuditFilter {
            event_types: Some(vec!["login.success".into()]),
            ..Default::default()
        }
        .matches(&event));
        assert!(!AuditFilter {
            event_types: Some(vec!["login.failed".into()]),
            ..Default::default()
        }
        .matches(&event));
        assert!(!AuditFilter {
            actor_id: Some("someone-else".into()),
            ..Default::default()
        }
        .matches(&event));
        assert!(!AuditFilter {
            realm: Some("other".into()),
            ..Default::default()
        }
        .matches(&event));
    }

    #[test]
    fn test_time_window_filter() {
        let now = Utc::now();
        let event = AuditEvent::new("acme", "x", ActorType::System, AuditResult::Success).at(now);

        assert!(AuditFilter {
            from: Some(now - chrono::Duration::minutes(1)),
            to: Some(now + chrono::Duration::minutes(1)),
            ..Default::default()
        }
        .matches(&event));
        assert!(!AuditFilter {
            from: Some(now + chrono::Duration::minutes(1)),
            ..Default::default()
        }
        .matches(&event));
    }
}
