//! Opaque identifiers used across the platform.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! entity_id {
    ($name:ident) => {
        /// Opaque unique identifier
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

entity_id!(UserId);
entity_id!(TokenId);
entity_id!(SessionId);
entity_id!(MethodId);
entity_id!(ChallengeId);
entity_id!(DeviceId);
entity_id!(AttemptId);
entity_id!(AuditId);

/// Token family id: the root of a refresh-token rotation chain.
/// Stored as a flat column on every token in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenFamily(pub Uuid);

impl TokenFamily {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TokenFamily {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TokenFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TokenFamily {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(UserId::new(), UserId::new());
        assert_ne!(TokenFamily::new(), TokenFamily::new());
    }

    #[test]
    fn test_display_round_trip() {
        let id = SessionId::new();
        let parsed: Uuid = id.to_string().parse().unwrap();
        assert_eq!(SessionId::from(parsed), id);
    }
}
