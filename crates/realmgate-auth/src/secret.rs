//! Symmetric encryption for secrets at rest.
//!
//! AES-256-GCM with a random 96-bit nonce prepended to the ciphertext. Used
//! for stored TOTP secrets; the key comes from realm configuration.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use realmgate_core::error::{Error, Result};
use realmgate_core::interfaces::SecretCipher;

const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 32 {
            return Err(Error::configuration(
                "secret encryption key must be 32 bytes",
            ));
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }
}

impl SecretCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::internal("secret encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() <= NONCE_LEN {
            return Err(Error::internal("ciphertext too short"));
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| Error::internal("secret decryption failed"))
    }
}
