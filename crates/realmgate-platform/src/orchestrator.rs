//! Realm orchestrator.
//!
//! One orchestrator per realm wires the engines together: the event bus, the
//! hook registry, the service table, and the engines themselves, all sharing
//! one clock and one store bundle. There is no global state; dropping the
//! orchestrator (after `shutdown`) leaves nothing running.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use realmgate_core::clock::{system_clock, SharedClock};
use realmgate_core::error::{Error, Result};
use realmgate_core::hook::{HookContext, HookKind, HookRegistry, HookReport};
use realmgate_core::id::UserId;
use realmgate_core::interfaces::{GeoLookup, Hasher, SecretCipher, Sender};
use realmgate_core::realm::RealmDescriptor;
use realmgate_core::service::ServiceTable;
use realmgate_audit::pipeline::AuditPipeline;
use realmgate_audit::store::AuditStore;
use realmgate_auth::backup_codes::BackupCodeStore;
use realmgate_auth::lockout::{LockoutEngine, LockoutStore};
use realmgate_auth::mfa::{MfaEngine, MfaStore};
use realmgate_auth::password::Argon2Hasher;
use realmgate_auth::rate_limit::{RateLimiter, SlidingWindowRateLimiter};
use realmgate_auth::secret::AesGcmCipher;
use realmgate_auth::tokens::{RoleSource, TokenEngine, TokenStore};
use realmgate_auth::trusted_device::TrustedDeviceStore;
use realmgate_events::EventBus;
use realmgate_sessions::cleanup::CleanupTask;
use realmgate_sessions::engine::SessionEngine;
use realmgate_sessions::session::SessionStore;
use realmgate_users::recovery::{RecoveryConfig, RecoveryManager, ResetTokenStore};
use realmgate_users::service::UserService;
use realmgate_users::user::UserStore;
use std::collections::HashMap;
use std::sync::Arc;

use crate::extension::{Extension, RealmHandle};
use crate::mirror::register_audit_mirror;
use crate::stores::RealmStores;

/// Host-supplied collaborators for one realm
pub struct RealmCollaborators {
    pub hasher: Arc<dyn Hasher>,
    pub cipher: Arc<dyn SecretCipher>,
    pub limiter: Arc<dyn RateLimiter>,
    /// Outbound one-time-code delivery, keyed by channel ("email", "sms")
    pub senders: HashMap<String, Arc<dyn Sender>>,
    pub geo: Option<Arc<dyn GeoLookup>>,
    pub clock: SharedClock,
}

impl RealmCollaborators {
    /// Defaults derived from the realm configuration: Argon2id hashing,
    /// AES-256-GCM secret encryption, in-memory rate limiting, no senders,
    /// no geolocation, system clock.
    pub fn defaults(descriptor: &RealmDescriptor) -> Result<Self> {
        let clock = system_clock();
        Ok(Self {
            hasher: Arc::new(Argon2Hasher::new(&descriptor.config.password_hashing)?),
            cipher: Arc::new(AesGcmCipher::new(&descriptor.config.mfa.encryption_key)?),
            limiter: Arc::new(SlidingWindowRateLimiter::new(clock.clone())),
            senders: HashMap::new(),
            geo: None,
            clock,
        })
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sender(mut self, channel: impl Into<String>, sender: Arc<dyn Sender>) -> Self {
        self.senders.insert(channel.into(), sender);
        self
    }

    pub fn with_geo(mut self, geo: Arc<dyn GeoLookup>) -> Self {
        self.geo = Some(geo);
        self
    }
}

/// Resolves a user's roles at token issuance time
struct UserRoleSource {
    users: Arc<UserService<dyn UserStore>>,
}

#[async_trait]
impl RoleSource for UserRoleSource {
    async fn roles_for(&self, user_id: UserId) -> Result<Vec<String>> {
        let user = self.users.get_user(user_id).await?;
        Ok(user.roles.into_iter().collect())
    }
}

/// One realm's fully wired engine set
pub struct RealmOrchestrator {
    pub(crate) descriptor: RealmDescriptor,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) hooks: Arc<HookRegistry>,
    pub(crate) services: Arc<ServiceTable>,
    pub(crate) clock: SharedClock,
    pub(crate) hasher: Arc<dyn Hasher>,
    pub(crate) geo: Option<Arc<dyn GeoLookup>>,
    pub(crate) users: Arc<UserService<dyn UserStore>>,
    pub(crate) recovery: Arc<RecoveryManager<dyn ResetTokenStore>>,
    pub(crate) tokens: Arc<TokenEngine<dyn TokenStore>>,
    pub(crate) lockout: Arc<LockoutEngine<dyn LockoutStore>>,
    pub(crate) mfa:
        Arc<MfaEngine<dyn MfaStore, dyn TrustedDeviceStore, dyn BackupCodeStore>>,
    pub(crate) sessions: Arc<SessionEngine<dyn SessionStore>>,
    pub(crate) audit: Arc<AuditPipeline<dyn AuditStore>>,
    cleanup: Mutex<Option<CleanupTask>>,
    extensions: RwLock<Vec<Arc<dyn Extension>>>,
}

impl RealmOrchestrator {
    /// Wire a realm from its descriptor, stores and collaborators
    pub fn new(
        descriptor: RealmDescriptor,
        stores: RealmStores,
        collaborators: RealmCollaborators,
    ) -> Result<Arc<Self>> {
        descriptor.config.validate()?;

        let realm = descriptor.name().to_string();
        let clock = collaborators.clock.clone();
        let bus = Arc::new(EventBus::new(&realm));
        let hooks = Arc::new(HookRegistry::new());
        let services = Arc::new(ServiceTable::new());

        let users: Arc<UserService<dyn UserStore>> = Arc::new(UserService::new(
            &realm,
            stores.users,
            collaborators.hasher.clone(),
            clock.clone(),
        ));

        let recovery: Arc<RecoveryManager<dyn ResetTokenStore>> = Arc::new(RecoveryManager::new(
            stores.reset_tokens,
            RecoveryConfig::default(),
            clock.clone(),
        ));

        let tokens: Arc<TokenEngine<dyn TokenStore>> = Arc::new(TokenEngine::new(
            &realm,
            descriptor.config.token.clone(),
            stores.tokens,
            Arc::new(UserRoleSource {
                users: users.clone(),
            }),
            collaborators.hasher.clone(),
            clock.clone(),
            bus.clone(),
        )?);

        let lockout: Arc<LockoutEngine<dyn LockoutStore>> = Arc::new(LockoutEngine::new(
            descriptor.config.account_lockout.clone(),
            stores.lockout,
            clock.clone(),
        ));

        let mfa = Arc::new(MfaEngine::new(
            &realm,
            descriptor.config.mfa.clone(),
            stores.mfa,
            stores.trusted_devices,
            stores.backup_codes,
            collaborators.limiter.clone(),
            collaborators.cipher.clone(),
            collaborators.senders.clone(),
            clock.clone(),
            bus.clone(),
        )?);

        let sessions: Arc<SessionEngine<dyn SessionStore>> = Arc::new(SessionEngine::new(
            &realm,
            descriptor.config.session.clone(),
            stores.sessions,
            clock.clone(),
            bus.clone(),
        ));
        sessions.register_subscribers(&bus);

        let audit: Arc<AuditPipeline<dyn AuditStore>> = Arc::new(AuditPipeline::new(
            descriptor.config.audit.clone(),
            stores.audit,
            clock.clone(),
        ));
        register_audit_mirror(&bus, audit.clone());

        Ok(Arc::new(Self {
            descriptor,
            bus,
            hooks,
            services,
            clock,
            hasher: collaborators.hasher,
            geo: collaborators.geo,
            users,
            recovery,
            tokens,
            lockout,
            mfa,
            sessions,
            audit,
            cleanup: Mutex::new(None),
            extensions: RwLock::new(Vec::new()),
        }))
    }

    pub fn realm(&self) -> &str {
        self.descriptor.name()
    }

    pub fn handle(&self) -> RealmHandle {
        RealmHandle {
            realm: self.realm().to_string(),
            hooks: self.hooks.clone(),
            bus: self.bus.clone(),
            services: self.services.clone(),
        }
    }

    // === Engine accessors ===

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn users(&self) -> &Arc<UserService<dyn UserStore>> {
        &self.users
    }

    pub fn tokens(&self) -> &Arc<TokenEngine<dyn TokenStore>> {
        &self.tokens
    }

    pub fn lockout(&self) -> &Arc<LockoutEngine<dyn LockoutStore>> {
        &self.lockout
    }

    pub fn mfa(
        &self,
    ) -> &Arc<MfaEngine<dyn MfaStore, dyn TrustedDeviceStore, dyn BackupCodeStore>> {
        &self.mfa
    }

    pub fn sessions(&self) -> &Arc<SessionEngine<dyn SessionStore>> {
        &self.sessions
    }

    pub fn audit(&self) -> &Arc<AuditPipeline<dyn AuditStore>> {
        &self.audit
    }

    pub fn services(&self) -> &Arc<ServiceTable> {
        &self.services
    }

    // === Hook dispatch ===

    /// Dispatch a hook kind under the realm's failure strategy
    pub(crate) async fn dispatch_hook(
        &self,
        kind: HookKind,
        payload: serde_json::Value,
    ) -> Result<HookReport> {
        let ctx = HookContext::new(self.realm(), kind, payload);
        self.hooks
            .dispatch(&ctx, self.descriptor.config.hook_failure_strategy)
            .await
    }

    // === Extensions ===

    /// Attach an extension to this realm
    pub async fn register_extension(&self, extension: Arc<dyn Extension>) -> Result<()> {
        extension.attach(&self.handle()).await?;
        tracing::info!(realm = %self.realm(), extension = extension.id(), "Extension attached");
        self.extensions.write().push(extension);
        Ok(())
    }

    /// Detach an extension and drop everything it registered
    pub async fn remove_extension(&self, id: &str) -> Result<()> {
        let extension = {
            let mut extensions = self.extensions.write();
            match extensions.iter().position(|e| e.id() == id) {
                Some(index) => extensions.remove(index),
                None => {
                    return Err(Error::ExtensionNotConfigured {
                        extension: id.to_string(),
                    })
                }
            }
        };

        extension.detach(&self.handle()).await?;
        self.hooks.remove_extension(id);
        self.bus.unsubscribe(id);
        Ok(())
    }

    // === Lifecycle ===

    /// Start background work (the session cleanup loop)
    pub fn start(&self) {
        let interval = self
            .descriptor
            .config
            .session
            .cleanup_interval
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(300));

        let mut cleanup = self.cleanup.lock();
        if cleanup.is_none() {
            *cleanup = Some(CleanupTask::spawn(self.sessions.clone(), interval));
        }
    }

    /// Stop background work, drain the bus and flush the audit queue
    pub async fn shutdown(&self) -> Result<()> {
        let cleanup = self.cleanup.lock().take();
        if let Some(task) = cleanup {
            task.shutdown().await?;
        }
        self.bus.shutdown().await;
        self.audit.shutdown().await;
        tracing::info!(realm = %self.realm(), "Realm shut down");
        Ok(())
    }
}
