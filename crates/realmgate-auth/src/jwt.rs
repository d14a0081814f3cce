//! Signed bearer tokens.
//!
//! HMAC-signed JWTs with the signing secret selected by the `kid` header.
//! Every configured secret verifies, the last one signs. Rotating means
//! appending a new secret: earlier entries keep their index, so outstanding
//! tokens' `kid`s still resolve to the secret that signed them. Verification
//! failures never carry detail out of this module; callers see `None`.

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, encode, DecodingKey, EncodingKey, Header, Validation};
use realmgate_core::clock::SharedClock;
use realmgate_core::config::{TokenConfig, TokenType};
use realmgate_core::error::{Error, Result};
use realmgate_core::id::{TokenFamily, TokenId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Token type discriminator
    #[serde(rename = "type")]
    pub typ: TokenType,
    /// Realm the token is valid in
    pub realm: String,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    /// JWT id; doubles as the stored-token id
    pub jti: String,
    /// Rotation chain root; refresh tokens only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_family: Option<TokenFamily>,
    /// Token this one was rotated from; refresh tokens only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_token_id: Option<TokenId>,
    /// Role names at issuance; access tokens only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
}

impl Claims {
    pub fn user_id(&self) -> Result<UserId> {
        self.sub
            .parse::<Uuid>()
            .map(UserId::from)
            .map_err(|_| Error::invalid_token("malformed subject"))
    }

    pub fn token_id(&self) -> Result<TokenId> {
        self.jti
            .parse::<Uuid>()
            .map(TokenId::from)
            .map_err(|_| Error::invalid_token("malformed jti"))
    }
}

/// The authenticated identity derived from a valid access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub realm: String,
    pub token_type: TokenType,
    /// Roles as of issuance time
    pub roles: Vec<String>,
}

impl Principal {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Signs with the last configured secret, verifies with any of them
pub struct JwtKeyring {
    signing_key: EncodingKey,
    signing_kid: String,
    decoding_keys: Vec<DecodingKey>,
    issuer: String,
    audience: String,
    clock: SharedClock,
}

impl JwtKeyring {
    pub fn new(config: &TokenConfig, clock: SharedClock) -> Result<Self> {
        let signing_secret = config
            .secrets
            .last()
            .ok_or_else(|| Error::configuration("token secrets must not be empty"))?;

        Ok(Self {
            signing_key: EncodingKey::from_secret(signing_secret.as_bytes()),
            signing_kid: (config.secrets.len() - 1).to_string(),
            decoding_keys: config
                .secrets
                .iter()
                .map(|s| DecodingKey::from_secret(s.as_bytes()))
                .collect(),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            clock,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Build claims for a fresh token
    #[allow(clippy::too_many_arguments)]
    pub fn claims(
        &self,
        user_id: UserId,
        realm: &str,
        typ: TokenType,
        token_id: TokenId,
        expires_at: DateTime<Utc>,
        token_family: Option<TokenFamily>,
        parent_token_id: Option<TokenId>,
        roles: Option<Vec<String>>,
    ) -> Claims {
        Claims {
            sub: user_id.to_string(),
            typ,
            realm: realm.to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            exp: expires_at.timestamp(),
            iat: self.clock.now().timestamp(),
            jti: token_id.to_string(),
            token_family,
            parent_token_id,
            roles,
        }
    }

    /// Sign claims; the header's `kid` records which secret signed
    pub fn sign(&self, claims: &Claims) -> Result<String> {
        let mut header = Header::default();
        header.kid = Some(self.signing_kid.clone());
        encode(&header, claims, &self.signing_key)
            .map_err(|e| Error::internal(format!("failed to sign token: {e}")))
    }

    /// Decode and validate signature, issuer, audience and expiry.
    /// Any mismatch, including an unknown `kid`, yields `None`.
    pub fn decode(&self, token: &str) -> Option<Claims> {
        let header = decode_header(token).ok()?;
        let kid: usize = header.kid.as_deref()?.parse().ok()?;
        let key = self.decoding_keys.get(kid)?;

        let mut validation = Validation::default();
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        decode::<Claims>(token, key, &validation)
            .map(|data| data.claims)
            .ok()
    }
}
