//! Namespaces are the isolation boundary: every operation is scoped to
//! exactly one namespace, and streams with identical names in different
//! namespaces are unrelated. Each namespace maps to a dedicated physical
//! container (schema, database file, or tree prefix); the registry is
//! authoritative.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const DEFAULT_NAMESPACE: &str = "default";

const MAX_ID_LEN: usize = 64;

/// A namespace registry record.
///
/// `token_hash` is the hex SHA-256 of the namespace's access token. It is
/// persisted and compared, never logged and never returned to callers; the
/// raw token is exposed exactly once, at issuance.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: String,
    pub token_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("id", &self.id)
            .field("token_hash", &"<redacted>")
            .field("description", &self.description)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Message statistics for one namespace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NamespaceStats {
    pub message_count: i64,
    pub last_global_position: Option<i64>,
}

/// Validates a namespace id before it names a physical container.
///
/// Ids are 1-64 characters of `[A-Za-z0-9_-]`, starting with a letter or
/// digit, so they embed safely in schema names, file names, and tree
/// prefixes.
pub fn validate_namespace_id(id: &str) -> Result<(), Error> {
    let mut chars = id.chars();
    let valid = match chars.next() {
        Some(first) if id.len() <= MAX_ID_LEN => {
            first.is_ascii_alphanumeric()
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidNamespaceId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_reasonable_ids() {
        for id in ["default", "my-app", "tenant_42", "A1"] {
            assert!(validate_namespace_id(id).is_ok(), "{id}");
        }
    }

    #[test]
    fn rejects_unsafe_ids() {
        for id in ["", "-leading", "_leading", "has space", "a/b", "a.b", "ns\"x"] {
            assert!(validate_namespace_id(id).is_err(), "{id:?}");
        }
        assert!(validate_namespace_id(&"x".repeat(65)).is_err());
        assert!(validate_namespace_id(&"x".repeat(64)).is_ok());
    }

    #[test]
    fn debug_redacts_token_hash() {
        let ns = Namespace {
            id: "default".to_string(),
            token_hash: "a".repeat(64),
            description: None,
            created_at: Utc::now(),
        };
        let debug = format!("{ns:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(&"a".repeat(64)));
    }
}
