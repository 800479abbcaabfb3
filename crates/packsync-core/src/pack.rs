// ABOUTME: Defines the Pack document and the namespaced storage keys packs are filed under.
// ABOUTME: Keys are "namespace/id" strings so a namespace can be listed or cleared by prefix scan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between the namespace and the id inside a storage key.
pub const KEY_SEPARATOR: char = '/';

/// Errors raised when a namespace or id cannot be turned into a storage key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("namespace must not be empty")]
    EmptyNamespace,

    #[error("pack id must not be empty")]
    EmptyId,

    #[error("{0:?} must not contain '/'")]
    Separator(String),
}

/// A named, versioned snapshot of data for one entity collection.
/// Saving a pack replaces the previous one at the same key wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pack {
    pub namespace: String,
    pub id: String,
    pub data: serde_json::Value,
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

impl Pack {
    /// Build a pack stamped with the current time.
    pub fn new(
        namespace: impl Into<String>,
        id: impl Into<String>,
        data: serde_json::Value,
        version: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
            data,
            version: version.into(),
            updated_at: Utc::now(),
        }
    }

    /// The `(namespace, id)` identity of this pack.
    pub fn key(&self) -> Result<PackKey, KeyError> {
        PackKey::new(&self.namespace, &self.id)
    }
}

/// Validated `(namespace, id)` identity of a pack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackKey {
    namespace: String,
    id: String,
}

impl PackKey {
    pub fn new(namespace: &str, id: &str) -> Result<Self, KeyError> {
        validate_namespace(namespace)?;
        if id.is_empty() {
            return Err(KeyError::EmptyId);
        }
        if id.contains(KEY_SEPARATOR) {
            return Err(KeyError::Separator(id.to_string()));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            id: id.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The flat string key used by the storage substrate.
    pub fn storage_key(&self) -> String {
        format!("{}{}{}", self.namespace, KEY_SEPARATOR, self.id)
    }

    /// Parse a storage key back into its parts. Returns None for keys that
    /// were not produced by `storage_key`.
    pub fn parse(storage_key: &str) -> Option<Self> {
        let (namespace, id) = storage_key.split_once(KEY_SEPARATOR)?;
        Self::new(namespace, id).ok()
    }
}

/// Prefix shared by every storage key in `namespace`.
pub fn namespace_prefix(namespace: &str) -> Result<String, KeyError> {
    validate_namespace(namespace)?;
    Ok(format!("{}{}", namespace, KEY_SEPARATOR))
}

fn validate_namespace(namespace: &str) -> Result<(), KeyError> {
    if namespace.is_empty() {
        return Err(KeyError::EmptyNamespace);
    }
    if namespace.contains(KEY_SEPARATOR) {
        return Err(KeyError::Separator(namespace.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_round_trips_through_parse() {
        let key = PackKey::new("bookmarks", "list").unwrap();
        assert_eq!(key.storage_key(), "bookmarks/list");

        let parsed = PackKey::parse("bookmarks/list").expect("should parse");
        assert_eq!(parsed, key);
        assert_eq!(parsed.namespace(), "bookmarks");
        assert_eq!(parsed.id(), "list");
    }

    #[test]
    fn rejects_separator_and_empty_parts() {
        assert_eq!(
            PackKey::new("", "list").unwrap_err(),
            KeyError::EmptyNamespace
        );
        assert_eq!(PackKey::new("bookmarks", "").unwrap_err(), KeyError::EmptyId);
        assert!(matches!(
            PackKey::new("bible/books", "list"),
            Err(KeyError::Separator(_))
        ));
        assert!(matches!(
            PackKey::new("notes", "a/b"),
            Err(KeyError::Separator(_))
        ));
    }

    #[test]
    fn namespace_prefix_does_not_match_sibling_namespaces() {
        let prefix = namespace_prefix("notes").unwrap();
        assert!("notes/1".starts_with(&prefix));
        assert!(!"notes_archive/1".starts_with(&prefix));
    }

    #[test]
    fn parse_rejects_foreign_keys() {
        assert!(PackKey::parse("no-separator").is_none());
        assert!(PackKey::parse("/orphan").is_none());
    }
}
