//! Typed auth events.
//!
//! Events are the glue between engines: the token engine publishes, the
//! session engine and audit mirror subscribe. Every event is realm-scoped.

use chrono::{DateTime, Utc};
use realmgate_core::id::{SessionId, TokenFamily, TokenId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event kind; the subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TokenIssued,
    TokenRefreshed,
    TokenRevoked,
    TokenReplayDetected,
    LoginSuccess,
    LoginFailed,
    AccountLocked,
    AccountUnlocked,
    UserCreated,
    UserUpdated,
    UserDeleted,
    SessionCreated,
    SessionRevoked,
    SessionAnomaly,
    MfaMethodActivated,
    MfaMethodRemoved,
    PasswordResetRequested,
    PasswordResetCompleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenIssued => "token.issued",
            Self::TokenRefreshed => "token.refreshed",
            Self::TokenRevoked => "token.revoked",
            Self::TokenReplayDetected => "token.replay_detected",
            Self::LoginSuccess => "login.success",
            Self::LoginFailed => "login.failed",
            Self::AccountLocked => "account.locked",
            Self::AccountUnlocked => "account.unlocked",
            Self::UserCreated => "user.created",
            Self::UserUpdated => "user.updated",
            Self::UserDeleted => "user.deleted",
            Self::SessionCreated => "session.created",
            Self::SessionRevoked => "session.revoked",
            Self::SessionAnomaly => "session.anomaly",
            Self::MfaMethodActivated => "mfa.method_activated",
            Self::MfaMethodRemoved => "mfa.method_removed",
            Self::PasswordResetRequested => "password_reset.requested",
            Self::PasswordResetCompleted => "password_reset.completed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Session anomaly classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    NewDevice,
    NewLocation,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewDevice => "new_device",
            Self::NewLocation => "new_location",
        }
    }
}

/// Typed payload per event kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventData {
    TokenIssued {
        user_id: UserId,
        token_family: TokenFamily,
        source_ip: Option<String>,
        user_agent: Option<String>,
        latitude: Option<f64>,
        longitude: Option<f64>,
        issued_at: DateTime<Utc>,
    },
    TokenRefreshed {
        user_id: UserId,
        token_family: TokenFamily,
        refreshed_at: DateTime<Utc>,
    },
    TokenRevoked {
        user_id: UserId,
        token_family: Option<TokenFamily>,
        token_id: Option<TokenId>,
    },
    TokenReplayDetected {
        user_id: UserId,
        token_family: TokenFamily,
        original_token_id: TokenId,
    },
    LoginSuccess {
        user_id: UserId,
        identifier: String,
        source_ip: Option<String>,
        user_agent: Option<String>,
    },
    LoginFailed {
        identifier: String,
        user_id: Option<UserId>,
        source_ip: Option<String>,
        reason: String,
    },
    AccountLocked {
        user_id: UserId,
        locked_until: Option<DateTime<Utc>>,
        reason: String,
    },
    AccountUnlocked {
        user_id: UserId,
    },
    UserCreated {
        user_id: UserId,
        email: Option<String>,
    },
    UserUpdated {
        user_id: UserId,
    },
    UserDeleted {
        user_id: UserId,
    },
    SessionCreated {
        user_id: UserId,
        session_id: SessionId,
        token_family: TokenFamily,
    },
    SessionRevoked {
        user_id: UserId,
        session_id: SessionId,
        reason: String,
    },
    SessionAnomaly {
        user_id: UserId,
        session_id: SessionId,
        anomaly: AnomalyKind,
    },
    MfaMethodActivated {
        user_id: UserId,
        method_type: String,
    },
    MfaMethodRemoved {
        user_id: UserId,
        method_type: String,
    },
    PasswordResetRequested {
        user_id: UserId,
    },
    PasswordResetCompleted {
        user_id: UserId,
    },
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TokenIssued { .. } => EventKind::TokenIssued,
            Self::TokenRefreshed { .. } => EventKind::TokenRefreshed,
            Self::TokenRevoked { .. } => EventKind::TokenRevoked,
            Self::TokenReplayDetected { .. } => EventKind::TokenReplayDetected,
            Self::LoginSuccess { .. } => EventKind::LoginSuccess,
            Self::LoginFailed { .. } => EventKind::LoginFailed,
            Self::AccountLocked { .. } => EventKind::AccountLocked,
            Self::AccountUnlocked { .. } => EventKind::AccountUnlocked,
            Self::UserCreated { .. } => EventKind::UserCreated,
            Self::UserUpdated { .. } => EventKind::UserUpdated,
            Self::UserDeleted { .. } => EventKind::UserDeleted,
            Self::SessionCreated { .. } => EventKind::SessionCreated,
            Self::SessionRevoked { .. } => EventKind::SessionRevoked,
            Self::SessionAnomaly { .. } => EventKind::SessionAnomaly,
            Self::MfaMethodActivated { .. } => EventKind::MfaMethodActivated,
            Self::MfaMethodRemoved { .. } => EventKind::MfaMethodRemoved,
            Self::PasswordResetRequested { .. } => EventKind::PasswordResetRequested,
            Self::PasswordResetCompleted { .. } => EventKind::PasswordResetCompleted,
        }
    }

    /// The user the event is about, when there is one
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Self::TokenIssued { user_id, .. }
            | Self::TokenRefreshed { user_id, .. }
            | Self::TokenRevoked { user_id, .. }
            | Self::TokenReplayDetected { user_id, .. }
            | Self::LoginSuccess { user_id, .. }
            | Self::AccountLocked { user_id, .. }
            | Self::AccountUnlocked { user_id }
            | Self::UserCreated { user_id, .. }
            | Self::UserUpdated { user_id }
            | Self::UserDeleted { user_id }
            | Self::SessionCreated { user_id, .. }
            | Self::SessionRevoked { user_id, .. }
            | Self::SessionAnomaly { user_id, .. }
            | Self::MfaMethodActivated { user_id, .. }
            | Self::MfaMethodRemoved { user_id, .. }
            | Self::PasswordResetRequested { user_id }
            | Self::PasswordResetCompleted { user_id } => Some(*user_id),
            Self::LoginFailed { user_id, .. } => *user_id,
        }
    }
}

/// A realm-scoped auth event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthEvent {
    pub id: Uuid,
    pub realm: String,
    pub data: EventData,
    pub occurred_at: DateTime<Utc>,
}

impl AuthEvent {
    pub fn new(realm: impl Into<String>, data: EventData) -> Self {
        Self {
            id: Uuid::now_v7(),
            realm: realm.into(),
            data,
            occurred_at: Utc::now(),
        }
    }

    pub fn at(realm: impl Into<String>, data: EventData, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            realm: realm.into(),
            data,
            occurred_at,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.data.kind()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_data() {
        let event = AuthEvent::new(
            "acme",
            EventData::AccountUnlocked {
                user_id: UserId::new(),
            },
        );
        assert_eq!(event.kind(), EventKind::AccountUnlocked);
        assert_eq!(event.kind().as_str(), "account.unlocked");
    }

    #[test]
    fn test_user_id_extraction() {
        let user_id = UserId::new();
        let event = AuthEvent::new(
            "acme",
            EventData::LoginFailed {
                identifier: "user@example.com".into(),
                user_id: Some(user_id),
                source_ip: None,
                reason: "invalid_credentials".into(),
            },
        );
        assert_eq!(event.data.user_id(), Some(user_id));
    }

    #[test]
    fn test_serializes_with_tag() {
        let event = AuthEvent::new(
            "acme",
            EventData::UserDeleted {
                user_id: UserId::new(),
            },
        );
        let json = event.to_json();
        assert_eq!(json["data"]["event"], "user_deleted");
        assert_eq!(json["realm"], "acme");
    }
}
