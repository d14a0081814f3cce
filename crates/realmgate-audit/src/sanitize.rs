//! Metadata sanitization.
//!
//! Applied once, on write. String leaves are HTML-escaped recursively through
//! nested maps and lists; values under sensitive keys are replaced with
//! `[REDACTED]`; nulls become empty strings; other scalars pass through.

use serde_json::Value;
use std::collections::BTreeMap;

/// Substrings that make a key sensitive wherever they appear
const SENSITIVE_TERMS: &[&str] = &[
    "password",
    "token",
    "secret",
    "credential",
    "authorization",
    "session",
    "csrf",
    "otp",
    "code",
];

/// Prefixes that make a bare "key" sensitive (`api_key`, `signingkey`, ...).
/// Without one of these, "key" alone stays (`monkey`, `keyboard`, `key_id`).
const KEY_PREFIXES: &[&str] = &["api", "access", "private", "signing", "encryption", "master"];

const REDACTED: &str = "[REDACTED]";

/// Whether a metadata key's value must be redacted
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();

    if SENSITIVE_TERMS.iter().any(|term| lower.contains(term)) {
        return true;
    }

    KEY_PREFIXES.iter().any(|prefix| {
        lower == format!("{prefix}key")
            || lower == format!("{prefix}_key")
            || lower == format!("{prefix}-key")
    })
}

/// HTML-escape a string leaf
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            _ => out.push(c),
        }
    }
    out
}

fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(escape_html(&s)),
        Value::Null => Value::String(String::new()),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    if is_sensitive_key(&k) {
                        (k, Value::String(REDACTED.to_string()))
                    } else {
                        (k, sanitize_value(v))
                    }
                })
                .collect(),
        ),
        other => other,
    }
}

/// Sanitize a whole metadata map
pub fn sanitize_metadata(metadata: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    metadata
        .into_iter()
        .map(|(key, value)| {
            if is_sensitive_key(&key) {
                (key, Value::String(REDACTED.to_string()))
            } else {
                (key, sanitize_value(value))
            }
        })
        .collect()
}
