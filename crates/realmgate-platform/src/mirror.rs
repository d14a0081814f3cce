//! Audit mirror.
//!
//! A low-priority subscriber that maps every bus event to an audit row and
//! enqueues it. Runs after the engines' own subscribers so mirrored rows
//! never precede the state they describe. Enqueue is non-blocking, so the
//! mirror can never stall dispatch.

use realmgate_audit::event::{ActorType, AuditEvent, AuditResult};
use realmgate_audit::pipeline::AuditPipeline;
use realmgate_audit::store::AuditStore;
use realmgate_events::{AuthEvent, EventBus, EventData, EventKind, Subscriber, SubscriberConfig};
use serde_json::Value;
use std::sync::Arc;

const MIRRORED_KINDS: &[EventKind] = &[
    EventKind::TokenIssued,
    EventKind::TokenRefreshed,
    EventKind::TokenRevoked,
    EventKind::TokenReplayDetected,
    EventKind::LoginSuccess,
    EventKind::LoginFailed,
    EventKind::AccountLocked,
    EventKind::AccountUnlocked,
    EventKind::UserCreated,
    EventKind::UserUpdated,
    EventKind::UserDeleted,
    EventKind::SessionCreated,
    EventKind::SessionRevoked,
    EventKind::SessionAnomaly,
    EventKind::MfaMethodActivated,
    EventKind::MfaMethodRemoved,
    EventKind::PasswordResetRequested,
    EventKind::PasswordResetCompleted,
];

/// Map one bus event to an audit row
pub fn to_audit_event(event: &AuthEvent) -> AuditEvent {
    let result = match event.kind() {
        EventKind::LoginFailed | EventKind::TokenReplayDetected => AuditResult::Failure,
        _ => AuditResult::Success,
    };

    let actor_type = match event.kind() {
        EventKind::LoginFailed if event.data.user_id().is_none() => ActorType::Anonymous,
        EventKind::AccountLocked
        | EventKind::AccountUnlocked
        | EventKind::SessionRevoked
        | EventKind::TokenRevoked => ActorType::System,
        _ => ActorType::User,
    };

    let mut row = AuditEvent::new(&event.realm, event.kind().as_str(), actor_type, result)
        .at(event.occurred_at);

    if let Some(user_id) = event.data.user_id() {
        row = row
            .with_actor(user_id.to_string())
            .with_target(user_id.to_string(), "user");
    }

    if let EventData::SessionCreated { session_id, .. }
    | EventData::SessionRevoked { session_id, .. }
    | EventData::SessionAnomaly { session_id, .. } = &event.data
    {
        row = row.with_session(session_id.to_string());
    }

    // Flatten the typed payload into metadata; sanitization happens at
    // enqueue, inside the pipeline.
    if let Ok(Value::Object(fields)) = serde_json::to_value(&event.data) {
        for (key, value) in fields {
            if key == "event" {
                continue;
            }
            row.metadata.insert(key, value);
        }
    }

    row
}

/// Subscribe the audit mirror to a realm's bus
pub fn register_audit_mirror<S: AuditStore + ?Sized + 'static>(
    bus: &EventBus,
    pipeline: Arc<AuditPipeline<S>>,
) {
    bus.subscribe(Subscriber::new(
        "audit_mirror",
        SubscriberConfig::new(MIRRORED_KINDS.to_vec()).with_priority(-10),
        move |event: Arc<AuthEvent>| {
            let pipeline = pipeline.clone();
            async move {
                pipeline.enqueue(to_audit_event(&event));
                Ok(())
            }
        },
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use realmgate_core::id::{SessionId, TokenFamily, UserId};

    #[test]
    fn test_login_failed_maps_to_failure() {
        let event = AuthEvent::new(
            "acme",
            EventData::LoginFailed {
                identifier: "user@example.com".into(),
                user_id: None,
                source_ip: Some("10.0.0.1".into()),
                reason: "invalid_credentials".into(),
            },
        );

        let row = to_audit_event(&event);
        assert_eq!(row.event_type, "login.failed");
        assert_eq!(row.result, AuditResult::Failure);
        assert_eq!(row.actor_type, ActorType::Anonymous);
        assert_eq!(row.metadata["identifier"], "user@example.com");
    }

    #[test]
    fn test_session_event_carries_session_id() {
        let session_id = SessionId::new();
        let event = AuthEvent::new(
            "acme",
            EventData::SessionRevoked {
                user_id: UserId::new(),
                session_id,
                reason: "logout".into(),
            },
        );

        let row = to_audit_event(&event);
        assert_eq!(row.session_id, Some(session_id.to_string()));
        assert_eq!(row.actor_type, ActorType::System);
    }

    #[test]
    fn test_token_issued_maps_to_success_with_actor() {
        let user_id = UserId::new();
        let event = AuthEvent::new(
            "acme",
            EventData::TokenIssued {
                user_id,
                token_family: TokenFamily::new(),
                source_ip: None,
                user_agent: None,
                latitude: None,
                longitude: None,
                issued_at: chrono::Utc::now(),
            },
        );

        let row = to_audit_event(&event);
        assert_eq!(row.result, AuditResult::Success);
        assert_eq!(row.actor_id, Some(user_id.to_string()));
    }
}
