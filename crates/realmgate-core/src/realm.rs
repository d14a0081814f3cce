//! Realm descriptor.
//!
//! A realm is the tenancy boundary: identities, tokens, sessions and audit
//! rows are never valid across realms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RealmConfig;

/// Realm descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Realm {
    /// Unique realm name; the scoping key on every entity
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Realm {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// A realm plus its resolved configuration
#[derive(Debug, Clone)]
pub struct RealmDescriptor {
    pub realm: Realm,
    pub config: RealmConfig,
}

impl RealmDescriptor {
    pub fn new(name: impl Into<String>, config: RealmConfig) -> Self {
        Self {
            realm: Realm::new(name),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.realm.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_name() {
        let descriptor = RealmDescriptor::new("acme", RealmConfig::default());
        assert_eq!(descriptor.name(), "acme");
    }
}
