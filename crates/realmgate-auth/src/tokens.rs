//! Token lifecycle engine.
//!
//! Issues signed access/refresh pairs, verifies presented tokens against the
//! keyring and the stored-token table, and rotates refresh tokens with
//! family-wide replay revocation. A token family is the rotation chain root;
//! every child carries the same family id plus its parent's token id.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use realmgate_core::clock::SharedClock;
use realmgate_core::config::{TokenConfig, TokenType};
use realmgate_core::error::{Error, Result};
use realmgate_core::id::{TokenFamily, TokenId, UserId};
use realmgate_core::interfaces::{GeoLocation, Hasher};
use realmgate_events::{AuthEvent, EventBus, EventData};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::jwt::{Claims, JwtKeyring, Principal};

/// A persisted token row; only the one-way digest of the emitted string is kept
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub id: TokenId,
    pub user_id: UserId,
    pub token_hash: String,
    pub token_type: TokenType,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token_family: TokenFamily,
    pub parent_token_id: Option<TokenId>,
    pub first_used_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Decision taken while atomically consuming a refresh token for rotation
#[derive(Debug, Clone)]
pub enum RotationOutcome {
    /// No row for the presented hash
    Missing,
    /// Revoked outside the rotation flow (logout, admin); never first-used
    Revoked(StoredToken),
    /// First presentation; timestamps set, row revoked when rotation is on
    FirstUse(StoredToken),
    /// Re-presentation within the grace period; treated as an idempotent retry
    GraceRetry(StoredToken),
    /// Consumed and past the grace period
    Replay(StoredToken),
}

/// Storage contract for stored tokens.
///
/// `consume_for_rotation` performs the whole state transition for one
/// presented refresh token in a single call so implementations can make it
/// atomic (one transaction, or one lock acquisition here).
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert(&self, token: &StoredToken) -> Result<()>;

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<StoredToken>>;

    async fn revoke_by_hash(&self, token_hash: &str) -> Result<()>;

    async fn delete_by_hash(&self, token_hash: &str) -> Result<()>;

    /// Mark every stored token for the user revoked; returns the count
    async fn revoke_all_for_user(&self, user_id: UserId) -> Result<u64>;

    /// Mark every token in the family revoked; returns the count
    async fn revoke_family(&self, family: TokenFamily) -> Result<u64>;

    /// Atomically classify and update a presented refresh token.
    ///
    /// First use sets `first_used_at`/`last_used_at` and, when `rotation_enabled`,
    /// marks the row revoked. A re-presentation within `grace_period` (enabled
    /// or not) refreshes `last_used_at`. Past the grace period the outcome is
    /// `Replay` when rotation is enabled, `GraceRetry` otherwise.
    async fn consume_for_rotation(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
        grace_period: Duration,
        rotation_enabled: bool,
    ) -> Result<RotationOutcome>;

    /// Count non-revoked, unexpired refresh tokens in a family
    async fn count_active_refresh_in_family(
        &self,
        family: TokenFamily,
        now: DateTime<Utc>,
    ) -> Result<u32>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Roles to embed into access-token claims at issuance time
#[async_trait]
pub trait RoleSource: Send + Sync {
    async fn roles_for(&self, user_id: UserId) -> Result<Vec<String>>;
}

/// Request-scoped context carried into issuance
#[derive(Debug, Clone, Default)]
pub struct IssueContext {
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub location: Option<GeoLocation>,
}

/// An issued access/refresh pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub token_family: TokenFamily,
}

/// Token lifecycle engine for one realm
pub struct TokenEngine<S: TokenStore + ?Sized> {
    realm: String,
    config: TokenConfig,
    keyring: JwtKeyring,
    store: Arc<S>,
    roles: Arc<dyn RoleSource>,
    hasher: Arc<dyn Hasher>,
    clock: SharedClock,
    bus: Arc<EventBus>,
}

impl<S: TokenStore + ?Sized> TokenEngine<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        realm: impl Into<String>,
        config: TokenConfig,
        store: Arc<S>,
        roles: Arc<dyn RoleSource>,
        hasher: Arc<dyn Hasher>,
        clock: SharedClock,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        config.validate()?;
        let keyring = JwtKeyring::new(&config, clock.clone())?;
        Ok(Self {
            realm: realm.into(),
            config,
            keyring,
            store,
            roles,
            hasher,
            clock,
            bus,
        })
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Decode a token's claims without consulting the store. Used by flows
    /// that need the subject or family of an already-trusted string (logout);
    /// not a substitute for `verify`.
    pub fn peek(&self, token_str: &str) -> Option<Claims> {
        self.keyring.decode(token_str)
    }

    /// Mint and persist one pair inside a family
    async fn mint_pair(
        &self,
        user_id: UserId,
        roles: Vec<String>,
        family: TokenFamily,
        parent: Option<TokenId>,
        now: DateTime<Utc>,
    ) -> Result<TokenPair> {
        let access_id = TokenId::new();
        let access_expires = now + self.config.validity.access;
        let access_claims = self.keyring.claims(
            user_id,
            &self.realm,
            TokenType::Access,
            access_id,
            access_expires,
            None,
            None,
            Some(roles),
        );
        let access_token = self.keyring.sign(&access_claims)?;

        let refresh_id = TokenId::new();
        let refresh_expires = now + self.config.validity.refresh;
        let refresh_claims = self.keyring.claims(
            user_id,
            &self.realm,
            TokenType::Refresh,
            refresh_id,
            refresh_expires,
            Some(family),
            parent,
            None,
        );
        let refresh_token = self.keyring.sign(&refresh_claims)?;

        for (token_str, id, typ, expires_at) in [
            (&access_token, access_id, TokenType::Access, access_expires),
            (
                &refresh_token,
                refresh_id,
                TokenType::Refresh,
                refresh_expires,
            ),
        ] {
            if self.config.persist(typ) {
                self.store
                    .insert(&StoredToken {
                        id,
                        user_id,
                        token_hash: self.hasher.hash_one_way(token_str),
                        token_type: typ,
                        revoked: false,
                        created_at: now,
                        expires_at,
                        token_family: family,
                        parent_token_id: parent,
                        first_used_at: None,
                        last_used_at: None,
                    })
                    .await?;
            }
        }

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.config.validity.access.num_seconds(),
            token_family: family,
        })
    }

    /// Issue a fresh pair in a new token family
    pub async fn issue(&self, user_id: UserId, ctx: &IssueContext) -> Result<TokenPair> {
        let now = self.clock.now();
        let roles = self.roles.roles_for(user_id).await?;
        let family = TokenFamily::new();
        let pair = self.mint_pair(user_id, roles, family, None, now).await?;

        self.bus
            .publish(AuthEvent::at(
                &self.realm,
                EventData::TokenIssued {
                    user_id,
                    token_family: family,
                    source_ip: ctx.source_ip.clone(),
                    user_agent: ctx.user_agent.clone(),
                    latitude: ctx.location.as_ref().map(|l| l.latitude),
                    longitude: ctx.location.as_ref().map(|l| l.longitude),
                    issued_at: now,
                },
                now,
            ))
            .await?;

        Ok(pair)
    }

    /// Validate a presented token; any mismatch yields `None`
    pub async fn verify(
        &self,
        token_str: &str,
        expected_type: TokenType,
    ) -> Result<Option<Principal>> {
        let claims = match self.keyring.decode(token_str) {
            Some(claims) => claims,
            None => return Ok(None),
        };

        if claims.typ != expected_type || claims.realm != self.realm {
            return Ok(None);
        }
        let user_id = match claims.user_id() {
            Ok(id) => id,
            Err(_) => return Ok(None),
        };

        if self.config.persist(expected_type) {
            let hash = self.hasher.hash_one_way(token_str);
            match self.store.find_by_hash(&hash).await? {
                Some(stored) if !stored.revoked => {}
                _ => return Ok(None),
            }
        }

        Ok(Some(Principal {
            user_id,
            realm: claims.realm,
            token_type: claims.typ,
            roles: claims.roles.unwrap_or_default(),
        }))
    }

    fn decode_refresh(&self, user_id: UserId, refresh_str: &str) -> Result<Claims> {
        let claims = self
            .keyring
            .decode(refresh_str)
            .ok_or_else(|| Error::invalid_token("malformed refresh token"))?;

        if claims.typ != TokenType::Refresh || claims.realm != self.realm {
            return Err(Error::invalid_token("not a refresh token for this realm"));
        }
        if claims.user_id()? != user_id {
            return Err(Error::invalid_token("subject mismatch"));
        }
        Ok(claims)
    }

    /// Rotate a refresh token according to the realm's rotation policy
    pub async fn refresh(&self, user_id: UserId, refresh_str: &str) -> Result<TokenPair> {
        let _claims = self.decode_refresh(user_id, refresh_str)?;
        let now = self.clock.now();
        let rotation = &self.config.rotation;
        let hash = self.hasher.hash_one_way(refresh_str);

        let outcome = self
            .store
            .consume_for_rotation(&hash, now, rotation.grace_period, rotation.enabled)
            .await?;

        let presented = match outcome {
            RotationOutcome::Missing | RotationOutcome::Revoked(_) => {
                return Err(Error::SuspiciousToken);
            }
            RotationOutcome::Replay(presented) => {
                self.bus
                    .publish(AuthEvent::at(
                        &self.realm,
                        EventData::TokenReplayDetected {
                            user_id,
                            token_family: presented.token_family,
                            original_token_id: presented.id,
                        },
                        now,
                    ))
                    .await?;

                if rotation.revoke_family_on_replay {
                    self.store.revoke_family(presented.token_family).await?;
                }

                return Err(Error::TokenReplayDetected {
                    token_family: presented.token_family.as_uuid(),
                    original_token_id: presented.id.as_uuid(),
                });
            }
            RotationOutcome::FirstUse(presented) | RotationOutcome::GraceRetry(presented) => {
                presented
            }
        };

        if presented.user_id != user_id {
            return Err(Error::SuspiciousToken);
        }

        let roles = self.roles.roles_for(user_id).await?;
        let pair = self
            .mint_pair(
                user_id,
                roles,
                presented.token_family,
                Some(presented.id),
                now,
            )
            .await?;

        self.bus
            .publish(AuthEvent::at(
                &self.realm,
                EventData::TokenRefreshed {
                    user_id,
                    token_family: presented.token_family,
                    refreshed_at: now,
                },
                now,
            ))
            .await?;

        Ok(pair)
    }

    /// Revoke a single token by its emitted string
    pub async fn revoke_token(&self, token_str: &str, delete: bool) -> Result<()> {
        let hash = self.hasher.hash_one_way(token_str);
        let stored = self.store.find_by_hash(&hash).await?;

        if delete {
            self.store.delete_by_hash(&hash).await?;
        } else {
            self.store.revoke_by_hash(&hash).await?;
        }

        if let Some(stored) = stored {
            self.bus
                .publish(AuthEvent::new(
                    &self.realm,
                    EventData::TokenRevoked {
                        user_id: stored.user_id,
                        token_family: Some(stored.token_family),
                        token_id: Some(stored.id),
                    },
                ))
                .await?;
        }
        Ok(())
    }

    /// Revoke every stored token for a user
    pub async fn revoke_all_for_user(&self, user_id: UserId) -> Result<u64> {
        let count = self.store.revoke_all_for_user(user_id).await?;
        self.bus
            .publish(AuthEvent::new(
                &self.realm,
                EventData::TokenRevoked {
                    user_id,
                    token_family: None,
                    token_id: None,
                },
            ))
            .await?;
        Ok(count)
    }

    /// Revoke every token in a family
    pub async fn revoke_family(&self, family: TokenFamily) -> Result<u64> {
        self.store.revoke_family(family).await
    }

    pub async fn prune_expired(&self) -> Result<u64> {
        self.store.delete_expired(self.clock.now()).await
    }
}

/// In-memory token store keyed by token hash
pub struct InMemoryTokenStore {
    tokens: RwLock<HashMap<String, StoredToken>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn insert(&self, token: &StoredToken) -> Result<()> {
        let mut tokens = self.tokens.write();
        if tokens.contains_key(&token.token_hash) {
            return Err(Error::integrity("token hash already exists"));
        }
        tokens.insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<StoredToken>> {
        Ok(self.tokens.read().get(token_hash).cloned())
    }

    async fn revoke_by_hash(&self, token_hash: &str) -> Result<()> {
        if let Some(token) = self.tokens.write().get_mut(token_hash) {
            token.revoked = true;
        }
        Ok(())
    }

    async fn delete_by_hash(&self, token_hash: &str) -> Result<()> {
        self.tokens.write().remove(token_hash);
        Ok(())
    }

    async fn revoke_all_for_user(&self, user_id: UserId) -> Result<u64> {
        let mut tokens = self.tokens.write();
        let mut count = 0;
        for token in tokens.values_mut() {
            if token.user_id == user_id && !token.revoked {
                token.revoked = true;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn revoke_family(&self, family: TokenFamily) -> Result<u64> {
        let mut tokens = self.tokens.write();
        let mut count = 0;
        for token in tokens.values_mut() {
            if token.token_family == family && !token.revoked {
                token.revoked = true;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn consume_for_rotation(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
        grace_period: Duration,
        rotation_enabled: bool,
    ) -> Result<RotationOutcome> {
        let mut tokens = self.tokens.write();
        let token = match tokens.get_mut(token_hash) {
            Some(token) => token,
            None => return Ok(RotationOutcome::Missing),
        };

        match token.first_used_at {
            None if token.revoked => Ok(RotationOutcome::Revoked(token.clone())),
            None => {
                token.first_used_at = Some(now);
                token.last_used_at = Some(now);
                if rotation_enabled {
                    token.revoked = true;
                }
                Ok(RotationOutcome::FirstUse(token.clone()))
            }
            Some(first_used) => {
                if now - first_used <= grace_period || !rotation_enabled {
                    token.last_used_at = Some(now);
                    Ok(RotationOutcome::GraceRetry(token.clone()))
                } else {
                    Ok(RotationOutcome::Replay(token.clone()))
                }
            }
        }
    }

    async fn count_active_refresh_in_family(
        &self,
        family: TokenFamily,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        Ok(self
            .tokens
            .read()
            .values()
            .filter(|t| {
                t.token_family == family
                    && t.token_type == TokenType::Refresh
                    && !t.revoked
                    && t.expires_at > now
            })
            .count() as u32)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tokens = self.tokens.write();
        let before = tokens.len();
        tokens.retain(|_, t| t.expires_at > now);
        Ok((before - tokens.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::Argon2Hasher;
    use realmgate_core::clock::{Clock, FixedClock};
    use realmgate_core::config::TokenRotation;
    use realmgate_events::EventKind;

    struct StaticRoles(Vec<String>);

    #[async_trait]
    impl RoleSource for StaticRoles {
        async fn roles_for(&self, _user_id: UserId) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    struct Fixture {
        engine: TokenEngine<InMemoryTokenStore>,
        store: Arc<InMemoryTokenStore>,
        bus: Arc<EventBus>,
        clock: FixedClock,
    }

    fn fixture(rotation: TokenRotation) -> Fixture {
        let clock = FixedClock::for_tests();
        let bus = Arc::new(EventBus::new("acme"));
        let store = Arc::new(InMemoryTokenStore::new());
        let config = TokenConfig {
            rotation,
            ..Default::default()
        };
        let engine = TokenEngine::new(
            "acme",
            config,
            store.clone(),
            Arc::new(StaticRoles(vec!["user".into()])),
            Arc::new(Argon2Hasher::default()),
            Arc::new(clock.clone()),
            bus.clone(),
        )
        .unwrap();
        Fixture {
            engine,
            store,
            bus,
            clock,
        }
    }

    #[tokio::test]
    async fn test_issue_then_verify_round_trip() {
        let f = fixture(TokenRotation::default());
        let user_id = UserId::new();

        let pair = f.engine.issue(user_id, &IssueContext::default()).await.unwrap();
        assert_eq!(pair.token_type, "Bearer");

        let principal = f
            .engine
            .verify(&pair.access_token, TokenType::Access)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(principal.user_id, user_id);
        assert_eq!(principal.roles, vec!["user".to_string()]);

        // Access token is not a refresh token.
        assert!(f
            .engine
            .verify(&pair.access_token, TokenType::Refresh)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_verify_altered_token_returns_none() {
        let f = fixture(TokenRotation::default());
        let pair = f
            .engine
            .issue(UserId::new(), &IssueContext::default())
            .await
            .unwrap();

        let mut altered = pair.access_token.into_bytes();
        let mid = altered.len() / 2;
        altered[mid] = if altered[mid] == b'a' { b'b' } else { b'a' };
        let altered = String::from_utf8(altered).unwrap();

        assert!(f
            .engine
            .verify(&altered, TokenType::Access)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_rotation_leaves_one_active_refresh_per_family() {
        let f = fixture(TokenRotation::default());
        let user_id = UserId::new();

        let pair = f.engine.issue(user_id, &IssueContext::default()).await.unwrap();
        let family = pair.token_family;

        let rotated = f.engine.refresh(user_id, &pair.refresh_token).await.unwrap();
        assert_eq!(rotated.token_family, family);

        let active = f
            .store
            .count_active_refresh_in_family(family, f.clock.now())
            .await
            .unwrap();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn test_grace_retry_is_idempotent_and_silent() {
        let f = fixture(TokenRotation {
            grace_period: Duration::seconds(30),
            ..Default::default()
        });
        let user_id = UserId::new();
        let mut replay_tap = f.bus.subscribe_broadcast();

        let pair = f.engine.issue(user_id, &IssueContext::default()).await.unwrap();
        let first = f.engine.refresh(user_id, &pair.refresh_token).await.unwrap();

        f.clock.advance(Duration::seconds(10));
        let second = f.engine.refresh(user_id, &pair.refresh_token).await.unwrap();

        assert_ne!(first.refresh_token, second.refresh_token);
        assert!(f
            .engine
            .verify(&second.access_token, TokenType::Access)
            .await
            .unwrap()
            .is_some());

        f.bus.shutdown().await;
        while let Ok(event) = replay_tap.try_recv() {
            assert_ne!(event.kind(), EventKind::TokenReplayDetected);
        }
    }

    #[tokio::test]
    async fn test_replay_after_grace_revokes_family() {
        let f = fixture(TokenRotation {
            enabled: true,
            grace_period: Duration::zero(),
            revoke_family_on_replay: true,
        });
        let user_id = UserId::new();

        let pair = f.engine.issue(user_id, &IssueContext::default()).await.unwrap();
        let r1 = f.engine.refresh(user_id, &pair.refresh_token).await.unwrap();
        let r2 = f.engine.refresh(user_id, &r1.refresh_token).await.unwrap();

        // Replaying the original refresh token is fatal for the family.
        f.clock.advance(Duration::seconds(1));
        let replay = f.engine.refresh(user_id, &pair.refresh_token).await;
        assert!(matches!(replay, Err(Error::TokenReplayDetected { .. })));

        assert!(f
            .engine
            .verify(&r2.refresh_token, TokenType::Refresh)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            f.store
                .count_active_refresh_in_family(pair.token_family, f.clock.now())
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_rotation_disabled_does_not_revoke_presented() {
        let f = fixture(TokenRotation {
            enabled: false,
            grace_period: Duration::zero(),
            revoke_family_on_replay: true,
        });
        let user_id = UserId::new();

        let pair = f.engine.issue(user_id, &IssueContext::default()).await.unwrap();
        f.engine.refresh(user_id, &pair.refresh_token).await.unwrap();

        f.clock.advance(Duration::minutes(5));
        // Old refresh still works and never raises replay.
        let again = f.engine.refresh(user_id, &pair.refresh_token).await;
        assert!(again.is_ok());
        assert!(f
            .engine
            .verify(&pair.refresh_token, TokenType::Refresh)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_unknown_refresh_is_suspicious() {
        let f = fixture(TokenRotation::default());
        let user_id = UserId::new();
        let pair = f.engine.issue(user_id, &IssueContext::default()).await.unwrap();

        // Revoke with delete, then present.
        f.engine.revoke_token(&pair.refresh_token, true).await.unwrap();
        let result = f.engine.refresh(user_id, &pair.refresh_token).await;
        assert!(matches!(result, Err(Error::SuspiciousToken)));
    }

    #[tokio::test]
    async fn test_revoke_all_for_user() {
        let f = fixture(TokenRotation::default());
        let user_id = UserId::new();

        let a = f.engine.issue(user_id, &IssueContext::default()).await.unwrap();
        let b = f.engine.issue(user_id, &IssueContext::default()).await.unwrap();

        let count = f.engine.revoke_all_for_user(user_id).await.unwrap();
        assert_eq!(count, 2);

        for pair in [a, b] {
            assert!(f
                .engine
                .verify(&pair.refresh_token, TokenType::Refresh)
                .await
                .unwrap()
                .is_none());
        }
    }

    #[tokio::test]
    async fn test_subject_mismatch_rejected() {
        let f = fixture(TokenRotation::default());
        let pair = f
            .engine
            .issue(UserId::new(), &IssueContext::default())
            .await
            .unwrap();

        let other = UserId::new();
        let result = f.engine.refresh(other, &pair.refresh_token).await;
        assert!(matches!(result, Err(Error::InvalidToken { .. })));
    }
}
