//! Secret Store and Log Masking
//!
//! Secrets are an opaque name/value map scoped to one run. They reach a
//! step's process environment only through that step's `env:` block;
//! the generic interpolation namespaces never see them. Any captured
//! output text passes through [`SecretStore::mask`] before it is logged
//! or persisted.

use std::collections::HashMap;

/// Replacement token for masked secret values.
pub const MASK: &str = "***";

/// Opaque name -> value map supplied by the host at run start.
#[derive(Debug, Clone, Default)]
pub struct SecretStore {
    values: HashMap<String, String>,
}

impl SecretStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store from name/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Adds one secret.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Looks up a secret by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Number of stored secrets.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no secrets are stored.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replaces every occurrence of a secret value in `text` with the
    /// mask token. Longer values are masked first so a secret that is a
    /// substring of another cannot leak the remainder.
    pub fn mask(&self, text: &str) -> String {
        let mut values: Vec<&String> = self
            .values
            .values()
            .filter(|v| !v.is_empty())
            .collect();
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));

        let mut masked = text.to_string();
        for value in values {
            if masked.contains(value.as_str()) {
                masked = masked.replace(value.as_str(), MASK);
            }
        }
        masked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_get() {
        let store = SecretStore::from_pairs([("TOKEN", "s3cr3t")]);
        assert_eq!(store.get("TOKEN"), Some("s3cr3t"));
        assert!(store.get("OTHER").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_mask_single_value() {
        let store = SecretStore::from_pairs([("TOKEN", "s3cr3t")]);
        assert_eq!(
            store.mask("auth with s3cr3t ok"),
            format!("auth with {} ok", MASK)
        );
    }

    #[test]
    fn test_mask_multiple_occurrences() {
        let store = SecretStore::from_pairs([("TOKEN", "abc")]);
        assert_eq!(store.mask("abc abc"), "*** ***");
    }

    #[test]
    fn test_mask_longest_first() {
        // "abc" is a substring of "abcdef"; masking the longer one first
        // must not leave "def" behind.
        let store = SecretStore::from_pairs([("SHORT", "abc"), ("LONG", "abcdef")]);
        assert_eq!(store.mask("x abcdef y"), "x *** y");
    }

    #[test]
    fn test_mask_no_secrets_passthrough() {
        let store = SecretStore::new();
        assert_eq!(store.mask("nothing here"), "nothing here");
    }

    #[test]
    fn test_mask_empty_value_ignored() {
        let store = SecretStore::from_pairs([("EMPTY", "")]);
        assert_eq!(store.mask("text"), "text");
    }
}
