//! Admin API.
//!
//! Every operation requires a principal holding the ADMIN role in this realm
//! and writes its own audit row with the admin as actor.

use realmgate_core::error::{Error, Result};
use realmgate_core::id::{MethodId, UserId};
use realmgate_audit::event::{ActorType, AuditEvent, AuditFilter, AuditResult};
use realmgate_audit::export::ExportFormat;
use realmgate_auth::jwt::Principal;
use realmgate_auth::mfa::{MfaMethod, ADMIN_ROLE};
use realmgate_events::EventData;
use chrono::{DateTime, Utc};

use crate::orchestrator::RealmOrchestrator;

impl RealmOrchestrator {
    fn require_admin(&self, actor: &Principal, action: &str) -> Result<()> {
        if actor.realm != self.realm() {
            return Err(Error::forbidden(action));
        }
        if !actor.has_role(ADMIN_ROLE) {
            return Err(Error::forbidden(action));
        }
        Ok(())
    }

    fn audit_admin_action(&self, actor: &Principal, action: &str, target: Option<UserId>) {
        let mut row = AuditEvent::new(self.realm(), action, ActorType::Admin, AuditResult::Success)
            .at(self.clock.now())
            .with_actor(actor.user_id.to_string());
        if let Some(target) = target {
            row = row.with_target(target.to_string(), "user");
        }
        self.audit.enqueue(row);
    }

    /// Lock an account; `until = None` locks indefinitely
    pub async fn admin_lock_account(
        &self,
        actor: &Principal,
        user_id: UserId,
        until: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<()> {
        self.require_admin(actor, "admin.lock_account")?;

        let lock = self.lockout.lock_account(user_id, until, reason).await?;
        self.bus
            .publish(realmgate_events::AuthEvent::new(
                self.realm(),
                EventData::AccountLocked {
                    user_id,
                    locked_until: lock.locked_until,
                    reason: lock.reason,
                },
            ))
            .await?;

        self.audit_admin_action(actor, "admin.lock_account", Some(user_id));
        Ok(())
    }

    pub async fn admin_unlock_account(&self, actor: &Principal, user_id: UserId) -> Result<()> {
        self.require_admin(actor, "admin.unlock_account")?;

        self.lockout.unlock_account(user_id).await?;
        self.lockout.clear_failed_attempts_for_user(user_id).await?;
        self.bus
            .publish(realmgate_events::AuthEvent::new(
                self.realm(),
                EventData::AccountUnlocked { user_id },
            ))
            .await?;

        self.audit_admin_action(actor, "admin.unlock_account", Some(user_id));
        Ok(())
    }

    /// Revoke every token and session the user holds
    pub async fn admin_revoke_user_access(
        &self,
        actor: &Principal,
        user_id: UserId,
    ) -> Result<()> {
        self.require_admin(actor, "admin.revoke_user_access")?;

        self.tokens.revoke_all_for_user(user_id).await?;
        self.sessions
            .revoke_all_for_user(user_id, "admin_revoked")
            .await?;

        self.audit_admin_action(actor, "admin.revoke_user_access", Some(user_id));
        Ok(())
    }

    pub async fn admin_force_remove_mfa_method(
        &self,
        actor: &Principal,
        user_id: UserId,
        method_id: MethodId,
    ) -> Result<()> {
        self.require_admin(actor, "admin.force_remove_mfa_method")?;

        self.mfa
            .force_remove_method(&actor.roles, user_id, method_id)
            .await?;
        self.audit_admin_action(actor, "admin.force_remove_mfa_method", Some(user_id));
        Ok(())
    }

    pub async fn admin_disable_mfa(&self, actor: &Principal, user_id: UserId) -> Result<()> {
        self.require_admin(actor, "admin.disable_mfa")?;

        self.mfa.disable_mfa_for_user(&actor.roles, user_id).await?;
        self.audit_admin_action(actor, "admin.disable_mfa", Some(user_id));
        Ok(())
    }

    pub async fn admin_list_mfa_methods(
        &self,
        actor: &Principal,
        user_id: UserId,
    ) -> Result<Vec<MfaMethod>> {
        self.require_admin(actor, "admin.list_mfa_methods")?;
        self.mfa.list_user_methods(&actor.roles, user_id).await
    }

    // === Audit access ===

    pub async fn admin_query_audit(
        &self,
        actor: &Principal,
        filter: &AuditFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AuditEvent>> {
        self.require_admin(actor, "admin.query_audit")?;
        let rows = self.audit.query(filter, limit, offset).await?;
        self.audit_admin_action(actor, "admin.query_audit", None);
        Ok(rows)
    }

    pub async fn admin_count_audit(&self, actor: &Principal, filter: &AuditFilter) -> Result<u64> {
        self.require_admin(actor, "admin.count_audit")?;
        self.audit.count(filter).await
    }

    pub async fn admin_export_audit(
        &self,
        actor: &Principal,
        filter: &AuditFilter,
        format: ExportFormat,
    ) -> Result<String> {
        self.require_admin(actor, "admin.export_audit")?;
        let rendered = self.audit.export(filter, format).await?;
        self.audit_admin_action(actor, "admin.export_audit", None);
        Ok(rendered)
    }

    /// Retention pass over the audit table
    pub async fn admin_prune_audit(&self, actor: &Principal) -> Result<u64> {
        self.require_admin(actor, "admin.prune_audit")?;
        self.audit.cleanup_old_audit_logs().await
    }
}
