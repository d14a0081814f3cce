//! Device fingerprinting.
//!
//! A fingerprint is the SHA-256 of the source IP concatenated with a
//! normalized user agent: browser family, OS family and form factor survive,
//! version numbers do not. The same normalization feeds MFA trusted devices
//! and session anomaly detection, so both sides agree on what "same device"
//! means.

use sha2::{Digest, Sha256};

/// Browser/OS families recognized by the normalizer, most specific first.
/// "Edg" before "Chrome" and "Chrome" before "Safari" because of UA token
/// inheritance.
const BROWSERS: &[(&str, &str)] = &[
    ("Edg", "Edge"),
    ("OPR", "Opera"),
    ("Firefox", "Firefox"),
    ("Chrome", "Chrome"),
    ("Safari", "Safari"),
    ("MSIE", "IE"),
    ("Trident", "IE"),
];

const PLATFORMS: &[(&str, &str)] = &[
    ("Android", "Android"),
    ("iPhone", "iOS"),
    ("iPad", "iOS"),
    ("Windows", "Windows"),
    ("Mac OS X", "macOS"),
    ("Macintosh", "macOS"),
    ("CrOS", "ChromeOS"),
    ("Linux", "Linux"),
];

/// Reduce a raw user agent to `browser/os/form-factor`
pub fn normalize_user_agent(user_agent: &str) -> String {
    let browser = BROWSERS
        .iter()
        .find(|(token, _)| user_agent.contains(token))
        .map(|(_, family)| *family)
        .unwrap_or("Other");

    let platform = PLATFORMS
        .iter()
        .find(|(token, _)| user_agent.contains(token))
        .map(|(_, family)| *family)
        .unwrap_or("Other");

    let form_factor = if user_agent.contains("Mobile")
        || user_agent.contains("iPhone")
        || user_agent.contains("Android")
    {
        "mobile"
    } else if user_agent.contains("iPad") || user_agent.contains("Tablet") {
        "tablet"
    } else {
        "desktop"
    };

    format!("{browser}/{platform}/{form_factor}")
}

/// SHA-256 fingerprint of IP + normalized user agent (hex-encoded)
pub fn fingerprint(ip: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(normalize_user_agent(user_agent).as_bytes());
    hex::encode(hasher.finalize())
}

/// Human-readable device name derived from the user agent
pub fn device_name(user_agent: &str) -> String {
    let normalized = normalize_user_agent(user_agent);
    let mut parts = normalized.split('/');
    let browser = parts.next().unwrap_or("Unknown");
    let platform = parts.next().unwrap_or("Unknown");
    format!("{browser} on {platform}")
}
