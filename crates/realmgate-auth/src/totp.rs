//! Time-based one-time passwords (RFC 6238).
//!
//! SHA-1 HMAC with 6 digits and a 30 second step, compatible with the common
//! authenticator apps. Verification accepts one step of clock skew either way
//! and reports which step matched so the caller can refuse step reuse.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use realmgate_core::error::{Error, Result};
use sha1::Sha1;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

/// TOTP parameters
#[derive(Debug, Clone)]
pub struct TotpConfig {
    /// Number of digits in the code
    pub digits: u32,
    /// Time step in seconds
    pub period: u64,
    /// Steps of skew accepted either side of "now"
    pub window: u32,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            digits: 6,
            period: 30,
            window: 1,
        }
    }
}

/// TOTP code generation and verification
pub struct Totp {
    config: TotpConfig,
}

impl Totp {
    pub fn new(config: TotpConfig) -> Self {
        Self { config }
    }

    /// Generate a fresh random secret, base32-encoded
    pub fn generate_secret() -> String {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        base32_encode(&bytes)
    }

    /// otpauth:// provisioning URI for QR codes
    pub fn provisioning_uri(&self, issuer: &str, account: &str, secret: &str) -> String {
        let issuer_enc = urlencoding::encode(issuer);
        let account_enc = urlencoding::encode(account);
        format!(
            "otpauth://totp/{}:{}?secret={}&issuer={}&algorithm=SHA1&digits={}&period={}",
            issuer_enc, account_enc, secret, issuer_enc, self.config.digits, self.config.period
        )
    }

    /// The step counter for a point in time
    pub fn counter_at(&self, at: DateTime<Utc>) -> u64 {
        (at.timestamp().max(0) as u64) / self.config.period
    }

    /// Generate the code for a specific counter
    pub fn code_for_counter(&self, secret: &str, counter: u64) -> Result<String> {
        let secret_bytes =
            base32_decode(secret).ok_or_else(|| Error::internal("invalid TOTP secret"))?;

        let mut mac = HmacSha1::new_from_slice(&secret_bytes)
            .map_err(|_| Error::internal("HMAC init failed"))?;
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        // Dynamic truncation (RFC 4226 §5.3)
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = ((digest[offset] & 0x7f) as u32) << 24
            | (digest[offset + 1] as u32) << 16
            | (digest[offset + 2] as u32) << 8
            | (digest[offset + 3] as u32);

        let otp = binary % 10u32.pow(self.config.digits);
        Ok(format!(
            "{:0>width$}",
            otp,
            width = self.config.digits as usize
        ))
    }

    /// Generate the current code
    pub fn code_at(&self, secret: &str, at: DateTime<Utc>) -> Result<String> {
        self.code_for_counter(secret, self.counter_at(at))
    }

    /// Verify a presented code within the skew window.
    ///
    /// Returns the matched step on success; a match at or before
    /// `last_used_counter` counts as reuse and fails.
    pub fn verify(
        &self,
        secret: &str,
        code: &str,
        at: DateTime<Utc>,
        last_used_counter: Option<u64>,
    ) -> Result<Option<u64>> {
        let current = self.counter_at(at);
        let window = self.config.window as u64;

        for counter in current.saturating_sub(window)..=current + window {
            let expected = self.code_for_counter(secret, counter)?;
            if expected.as_bytes().ct_eq(code.as_bytes()).into() {
                if let Some(last) = last_used_counter {
                    if counter <= last {
                        return Ok(None);
                    }
                }
                return Ok(Some(counter));
            }
        }

        Ok(None)
    }
}

impl Default for Totp {
    fn default() -> Self {
        Self::new(TotpConfig::default())
    }
}

/// Base32 encode (RFC 4648 alphabet, no padding)
fn base32_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut result = String::new();
    let mut buffer = 0u64;
    let mut bits = 0;

    for &byte in bytes {
        buffer = (buffer << 8) | (byte as u64);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            result.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }

    if bits > 0 {
        result.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }

    result
}

/// Base32 decode; `None` on characters outside the alphabet
fn base32_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let input = input.to_uppercase();
    let input = input.trim_end_matches('=');

    let mut result = Vec::new();
    let mut buffer = 0u64;
    let mut bits = 0;

    for c in input.chars() {
        let idx = ALPHABET.iter().position(|&b| b == c as u8)?;
        buffer = (buffer << 5) | (idx as u64);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            result.push((buffer >> bits) as u8);
        }
    }

    Some(result)
}
