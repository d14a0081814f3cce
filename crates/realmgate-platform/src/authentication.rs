//! Authentication, user-management and self-service APIs.
//!
//! The login path follows the platform's control flow: throttle pre-checks,
//! credential verification, lock bookkeeping, MFA gating, then token
//! issuance. Session creation and audit rows fall out of the published
//! events. Unknown user and wrong password are indistinguishable to callers.

use realmgate_core::config::TokenType;
use realmgate_core::error::{Error, Result};
use realmgate_core::hook::HookKind;
use realmgate_core::id::{ChallengeId, MethodId, SessionId, TokenFamily, UserId};
use realmgate_core::interfaces::GeoLocation;
use realmgate_auth::jwt::Principal;
use realmgate_auth::lockout::{LockDecision, ThrottleDecision};
use realmgate_auth::mfa::DeviceInfo;
use realmgate_auth::tokens::{IssueContext, TokenPair};
use realmgate_events::{AuthEvent, EventData};
use realmgate_sessions::session::{Session, SessionHistoryEntry};
use realmgate_users::service::{NewUser, UserUpdate};
use realmgate_users::user::User;
use serde_json::json;

use crate::orchestrator::RealmOrchestrator;

/// Request-scoped caller context
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// A second-factor proof presented during login
#[derive(Debug, Clone)]
pub enum MfaProof {
    Totp { method_id: MethodId, code: String },
    Challenge { challenge_id: ChallengeId, code: String },
    BackupCode { code: String },
}

/// Login input
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub identifier: String,
    pub password: String,
    pub context: RequestContext,
    pub mfa: Option<MfaProof>,
    /// Trust this device after a successful MFA verification
    pub remember_device: bool,
}

/// Successful login
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub user: User,
    pub tokens: TokenPair,
}

impl RealmOrchestrator {
    async fn publish(&self, data: EventData) -> Result<()> {
        self.bus
            .publish(AuthEvent::new(self.realm(), data))
            .await
    }

    fn retry_after_secs(&self) -> u64 {
        self.descriptor
            .config
            .account_lockout
            .attempt_window
            .num_seconds()
            .max(0) as u64
    }

    async fn record_login_failure(
        &self,
        identifier: &str,
        user_id: Option<UserId>,
        ctx: &RequestContext,
        reason: &str,
    ) -> Result<()> {
        self.lockout
            .record_failed_attempt(identifier, user_id, ctx.source_ip.as_deref(), reason)
            .await?;

        // A user who just crossed the threshold gets a timed lock.
        if let Some(user_id) = user_id {
            if let LockDecision::ShouldLock { attempt_count } =
                self.lockout.should_lock_account(user_id).await?
            {
                let lock = self
                    .lockout
                    .lock_account_for_policy_duration(user_id, "too_many_failed_attempts")
                    .await?;
                tracing::warn!(
                    realm = %self.realm(),
                    user_id = %user_id,
                    attempt_count,
                    "Account locked after repeated failures"
                );
                self.publish(EventData::AccountLocked {
                    user_id,
                    locked_until: lock.locked_until,
                    reason: lock.reason,
                })
                .await?;
            }
        }

        self.publish(EventData::LoginFailed {
            identifier: identifier.to_string(),
            user_id,
            source_ip: ctx.source_ip.clone(),
            reason: reason.to_string(),
        })
        .await
    }

    async fn verify_mfa_proof(
        &self,
        user_id: UserId,
        proof: &MfaProof,
        device: Option<&DeviceInfo>,
    ) -> Result<()> {
        match proof {
            MfaProof::Totp { method_id, code } => {
                self.mfa.verify_totp(user_id, *method_id, code, device).await
            }
            MfaProof::Challenge { challenge_id, code } => {
                self.mfa
                    .verify_challenge(user_id, *challenge_id, code, device)
                    .await
            }
            MfaProof::BackupCode { code } => self.mfa.verify_backup_code(user_id, code).await,
        }
    }

    async fn lookup_location(&self, ctx: &RequestContext) -> Option<GeoLocation> {
        if !self.descriptor.config.session.geo_location_enabled {
            return None;
        }
        let geo = self.geo.as_ref()?;
        let ip = ctx.source_ip.as_deref()?;
        geo.lookup(ip).await
    }

    /// Authenticate credentials and issue a token pair
    pub async fn login(&self, request: LoginRequest) -> Result<LoginResponse> {
        let ctx = &request.context;
        let identifier = request.identifier.as_str();

        self.dispatch_hook(
            HookKind::PreAuthenticate,
            json!({ "identifier": identifier, "source_ip": ctx.source_ip }),
        )
        .await?;

        // Throttle before touching credentials.
        if let ThrottleDecision::Throttled { attempt_count } =
            self.lockout.should_throttle_identifier(identifier).await?
        {
            tracing::warn!(realm = %self.realm(), identifier, attempt_count, "Identifier throttled");
            return Err(Error::RateLimited {
                retry_after_secs: self.retry_after_secs(),
            });
        }
        if let Some(ip) = ctx.source_ip.as_deref() {
            if let ThrottleDecision::Throttled { attempt_count } =
                self.lockout.should_throttle_ip(ip).await?
            {
                tracing::warn!(realm = %self.realm(), ip, attempt_count, "IP throttled");
                return Err(Error::RateLimited {
                    retry_after_secs: self.retry_after_secs(),
                });
            }
        }

        let user = match self.users.find_by_identifier(identifier).await? {
            Some(user) => user,
            None => {
                self.record_login_failure(identifier, None, ctx, "unknown_identifier")
                    .await?;
                return Err(Error::InvalidCredentials);
            }
        };

        // The account lock is reported once the user is identified, before
        // the password is checked.
        if self
            .lockout
            .is_account_locked(user.id, self.clock.now())
            .await?
        {
            let lock = self.lockout.get_lock(user.id).await?;
            return Err(Error::AccountLocked {
                locked_until: lock.as_ref().and_then(|l| l.locked_until),
                reason: lock
                    .map(|l| l.reason)
                    .unwrap_or_else(|| "locked".to_string()),
            });
        }

        if !self.hasher.verify(&request.password, &user.password_hash)? {
            self.record_login_failure(identifier, Some(user.id), ctx, "invalid_credentials")
                .await?;
            return Err(Error::InvalidCredentials);
        }

        if !user.is_active() {
            self.record_login_failure(identifier, Some(user.id), ctx, "account_disabled")
                .await?;
            return Err(Error::AccountLocked {
                locked_until: None,
                reason: "account_disabled".to_string(),
            });
        }

        // MFA gate: a realm that requires MFA challenges every enrolled user
        // unless the device is already trusted.
        if self.descriptor.config.mfa.require_mfa && self.mfa.has_active_method(user.id).await? {
            let trusted = match (ctx.source_ip.as_deref(), ctx.user_agent.as_deref()) {
                (Some(ip), Some(ua)) => self.mfa.is_device_trusted(user.id, ip, ua).await?,
                _ => false,
            };

            if !trusted {
                let proof = request.mfa.as_ref().ok_or(Error::MfaRequired)?;
                let device = match (ctx.source_ip.as_deref(), ctx.user_agent.as_deref()) {
                    (Some(ip), Some(ua)) => Some(DeviceInfo {
                        ip: ip.to_string(),
                        user_agent: ua.to_string(),
                        remember_device: request.remember_device,
                        device_name: None,
                    }),
                    _ => None,
                };
                self.verify_mfa_proof(user.id, proof, device.as_ref())
                    .await
                    .map_err(|e| {
                        tracing::warn!(realm = %self.realm(), user_id = %user.id, error = %e, "MFA verification failed");
                        e
                    })?;
            }
        }

        self.lockout
            .handle_successful_login(user.id, identifier)
            .await?;

        self.dispatch_hook(
            HookKind::PostAuthenticate,
            json!({ "user_id": user.id.to_string() }),
        )
        .await?;

        self.publish(EventData::LoginSuccess {
            user_id: user.id,
            identifier: identifier.to_string(),
            source_ip: ctx.source_ip.clone(),
            user_agent: ctx.user_agent.clone(),
        })
        .await?;

        let tokens = self.issue_tokens(user.id, ctx).await?;
        Ok(LoginResponse { user, tokens })
    }

    /// Mint a pair directly (post-MFA flows, admin impersonation is not one)
    pub async fn issue_tokens(&self, user_id: UserId, ctx: &RequestContext) -> Result<TokenPair> {
        let location = self.lookup_location(ctx).await;
        let pair = self
            .tokens
            .issue(
                user_id,
                &IssueContext {
                    source_ip: ctx.source_ip.clone(),
                    user_agent: ctx.user_agent.clone(),
                    location,
                },
            )
            .await?;

        self.dispatch_hook(
            HookKind::PostTokenIssue,
            json!({ "user_id": user_id.to_string(), "token_family": pair.token_family.to_string() }),
        )
        .await?;

        Ok(pair)
    }

    /// Rotate a refresh token per the realm's rotation policy
    pub async fn refresh(&self, user_id: UserId, refresh_token: &str) -> Result<TokenPair> {
        let pair = self.tokens.refresh(user_id, refresh_token).await?;

        self.dispatch_hook(
            HookKind::PostTokenRefresh,
            json!({ "user_id": user_id.to_string(), "token_family": pair.token_family.to_string() }),
        )
        .await?;

        Ok(pair)
    }

    /// Validate an access token into a principal; `None` on any mismatch
    pub async fn verify_access(&self, access_token: &str) -> Result<Option<Principal>> {
        self.tokens.verify(access_token, TokenType::Access).await
    }

    /// Revoke the presented refresh token and its session. Idempotent; an
    /// unknown token is a no-op.
    pub async fn logout(&self, refresh_token: &str) -> Result<()> {
        let claims = self.tokens.peek(refresh_token);

        self.tokens.revoke_token(refresh_token, false).await?;

        if let Some(claims) = claims {
            if let Some(family) = claims.token_family {
                self.sessions.revoke_by_family(family, "logout").await?;
            }
        }
        Ok(())
    }

    // === Self-service password reset ===

    /// Start a password reset. Returns the one-time token for delivery, or
    /// `None` for an unknown identifier (indistinguishable to the caller).
    pub async fn request_password_reset(
        &self,
        identifier: &str,
        ctx: &RequestContext,
    ) -> Result<Option<String>> {
        let user = match self.users.find_by_identifier(identifier).await? {
            Some(user) => user,
            None => return Ok(None),
        };

        self.dispatch_hook(
            HookKind::PrePasswordReset,
            json!({ "user_id": user.id.to_string() }),
        )
        .await?;

        let (token, _) = self
            .recovery
            .request(user.id, ctx.source_ip.as_deref())
            .await?;

        self.publish(EventData::PasswordResetRequested { user_id: user.id })
            .await?;
        Ok(Some(token))
    }

    /// Complete a password reset: consume the token, rotate the password,
    /// and revoke every live token and session for the user.
    pub async fn complete_password_reset(
        &self,
        reset_token: &str,
        new_password: &str,
    ) -> Result<()> {
        let token = self.recovery.consume(reset_token).await?;

        self.users.set_password(token.user_id, new_password).await?;
        self.tokens.revoke_all_for_user(token.user_id).await?;
        self.sessions
            .revoke_all_for_user(token.user_id, "password_reset")
            .await?;

        self.dispatch_hook(
            HookKind::PostPasswordReset,
            json!({ "user_id": token.user_id.to_string() }),
        )
        .await?;

        self.publish(EventData::PasswordResetCompleted {
            user_id: token.user_id,
        })
        .await
    }

    // === User management ===

    /// Create a user; `PreUserCreate` hooks run first (content validation
    /// lives there) and can veto under `FAIL_FAST`.
    pub async fn create_user(&self, input: NewUser) -> Result<User> {
        self.dispatch_hook(
            HookKind::PreUserCreate,
            json!({ "email": input.email, "phone": input.phone }),
        )
        .await?;

        let user = self.users.create_user(input).await?;

        self.dispatch_hook(
            HookKind::PostUserCreate,
            json!({ "user_id": user.id.to_string() }),
        )
        .await?;
        self.publish(EventData::UserCreated {
            user_id: user.id,
            email: user.email.clone(),
        })
        .await?;

        Ok(user)
    }

    pub async fn update_user(&self, user_id: UserId, update: UserUpdate) -> Result<User> {
        self.dispatch_hook(
            HookKind::PreUserUpdate,
            json!({ "user_id": user_id.to_string() }),
        )
        .await?;

        let user = self.users.update_user(user_id, update).await?;

        self.dispatch_hook(
            HookKind::PostUserUpdate,
            json!({ "user_id": user_id.to_string() }),
        )
        .await?;
        self.publish(EventData::UserUpdated { user_id }).await?;
        Ok(user)
    }

    /// Delete a user and cascade: tokens, sessions, MFA state, lockout rows
    /// and outstanding reset tokens all go with the account.
    pub async fn delete_user(&self, user_id: UserId) -> Result<()> {
        self.dispatch_hook(
            HookKind::PreUserDelete,
            json!({ "user_id": user_id.to_string() }),
        )
        .await?;

        let user = self.users.delete_user(user_id).await?;

        self.tokens.revoke_all_for_user(user_id).await?;
        self.sessions
            .revoke_all_for_user(user_id, "user_deleted")
            .await?;
        self.mfa.purge_user(user_id).await?;
        self.lockout.clear_failed_attempts_for_user(user_id).await?;
        self.lockout
            .clear_failed_attempts_for_identifier(&user.identifier())
            .await?;
        self.lockout.unlock_account(user_id).await?;
        self.recovery.invalidate_for_user(user_id).await?;

        self.dispatch_hook(
            HookKind::PostUserDelete,
            json!({ "user_id": user_id.to_string() }),
        )
        .await?;
        self.publish(EventData::UserDeleted { user_id }).await
    }

    pub async fn assign_role(&self, user_id: UserId, role: &str) -> Result<User> {
        let user = self.users.assign_role(user_id, role).await?;
        self.publish(EventData::UserUpdated { user_id }).await?;
        Ok(user)
    }

    pub async fn remove_role(&self, user_id: UserId, role: &str) -> Result<User> {
        let user = self.users.remove_role(user_id, role).await?;
        self.publish(EventData::UserUpdated { user_id }).await?;
        Ok(user)
    }

    // === Session API ===

    pub async fn list_active_sessions(&self, user_id: UserId) -> Result<Vec<Session>> {
        self.sessions.list_active(user_id).await
    }

    pub async fn get_session_by_family(
        &self,
        token_family: TokenFamily,
    ) -> Result<Option<Session>> {
        self.sessions.get_by_family(token_family).await
    }

    pub async fn revoke_session(&self, session_id: SessionId, reason: &str) -> Result<()> {
        self.sessions.revoke(session_id, reason, false).await?;
        Ok(())
    }

    pub async fn revoke_all_sessions(&self, user_id: UserId, reason: &str) -> Result<u64> {
        self.tokens.revoke_all_for_user(user_id).await?;
        self.sessions.revoke_all_for_user(user_id, reason).await
    }

    pub async fn session_history(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SessionHistoryEntry>> {
        self.sessions.history(user_id, limit, offset).await
    }
}
