//! Password hashing and token digests.

use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString,
    },
    Argon2, Params,
};
use realmgate_core::config::PasswordHashingConfig;
use realmgate_core::error::{Error, Result};
use realmgate_core::interfaces::Hasher;
use sha2::{Digest, Sha256};

/// Argon2id password hasher; also provides the SHA-256 one-way digest used to
/// persist emitted token strings.
pub struct Argon2Hasher {
    argon2: Argon2<'static>,
}

impl Argon2Hasher {
    pub fn new(config: &PasswordHashingConfig) -> Result<Self> {
        let params = Params::new(
            config.memory_kib,
            config.iterations,
            config.parallelism,
            None,
        )
        .map_err(|e| Error::configuration(format!("invalid argon2 parameters: {e}")))?;

        Ok(Self {
            argon2: Argon2::new(
                argon2::Algorithm::Argon2id,
                argon2::Version::V0x13,
                params,
            ),
        })
    }
}

impl Default for Argon2Hasher {
    fn default() -> Self {
        Self {
            argon2: Argon2::default(),
        }
    }
}

impl Hasher for Argon2Hasher {
    fn hash(&self, plaintext: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|e| Error::internal(format!("failed to hash password: {e}")))?;
        Ok(hash.to_string())
    }

    fn verify(&self, plaintext: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| Error::internal(format!("invalid password hash format: {e}")))?;
        Ok(self
            .argon2
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok())
    }

    fn hash_one_way(&self, token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }
}
