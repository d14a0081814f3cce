//! Interfaces the platform consumes from its host.
//!
//! Concrete implementations live in `realmgate-auth` (hashing, encryption) or
//! are supplied by the embedding application (senders, geolocation).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Password hashing plus the one-way digest used for stored token strings
pub trait Hasher: Send + Sync {
    /// Hash a password for storage
    fn hash(&self, plaintext: &str) -> Result<String>;

    /// Constant-time verification against a stored hash
    fn verify(&self, plaintext: &str, hash: &str) -> Result<bool>;

    /// One-way digest of an emitted token string (hex-encoded)
    fn hash_one_way(&self, token: &str) -> String;
}

/// Symmetric encryption for secrets at rest (stored MFA secrets)
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Outbound one-time-code delivery for a single channel (email, SMS, ...)
#[async_trait]
pub trait Sender: Send + Sync {
    /// Channel name for logging ("email", "sms")
    fn channel(&self) -> &str;

    async fn send(&self, recipient: &str, code: &str) -> Result<()>;
}

/// Resolved geolocation for an IP address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub country: Option<String>,
    pub city: Option<String>,
}

/// Optional IP geolocation lookup
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: &str) -> Option<GeoLocation>;
}
