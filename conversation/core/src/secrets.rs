//! Secret Registry
//!
//! Named secrets agents may reference in tool commands. Values are either
//! static strings or closures evaluated on first use. Every value ever handed
//! out is remembered so it can be masked in logs and rendered events.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// Replacement text for masked secrets
pub const SECRET_MASK: &str = "<secret-hidden>";

/// A secret value
#[derive(Clone)]
pub enum SecretValue {
    /// Known up front
    Static(String),
    /// Computed when first requested
    Lazy(Arc<dyn Fn() -> String + Send + Sync>),
}

impl SecretValue {
    /// Secret computed by `f` on first use
    pub fn lazy(f: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self::Lazy(Arc::new(f))
    }
}

impl From<&str> for SecretValue {
    fn from(s: &str) -> Self {
        Self::Static(s.to_string())
    }
}

impl From<String> for SecretValue {
    fn from(s: String) -> Self {
        Self::Static(s)
    }
}

// Never print secret material
impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(_) => f.write_str("Static(<hidden>)"),
            Self::Lazy(_) => f.write_str("Lazy(<fn>)"),
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    values: BTreeMap<String, SecretValue>,
    resolved: BTreeSet<String>,
}

/// Thread-safe store of named secrets
#[derive(Debug, Default)]
pub struct SecretRegistry {
    inner: RwLock<Registry>,
}

impl SecretRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace secrets
    pub fn update_secrets<K, V>(&self, secrets: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<SecretValue>,
    {
        let mut inner = self.inner.write();
        let mut added = 0usize;
        for (key, value) in secrets {
            let value = value.into();
            if let SecretValue::Static(text) = &value {
                if !text.is_empty() {
                    inner.resolved.insert(text.clone());
                }
            }
            inner.values.insert(key.into(), value);
            added += 1;
        }
        tracing::debug!(added, total = inner.values.len(), "Updated secrets");
    }

    /// Resolve a secret by name
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        let value = self.inner.read().values.get(key).cloned()?;
        let text = match value {
            SecretValue::Static(text) => text,
            SecretValue::Lazy(f) => {
                let text = f();
                if !text.is_empty() {
                    self.inner.write().resolved.insert(text.clone());
                }
                text
            }
        };
        Some(text)
    }

    /// Names of all secrets, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner.read().values.keys().cloned().collect()
    }

    /// Whether no secrets are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().values.is_empty()
    }

    /// Names of secrets mentioned in `text` (case-insensitive)
    #[must_use]
    pub fn find_in_text(&self, text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        self.inner
            .read()
            .values
            .keys()
            .filter(|key| lower.contains(&key.to_lowercase()))
            .cloned()
            .collect()
    }

    /// Environment variables for every secret `command` mentions
    #[must_use]
    pub fn env_for_command(&self, command: &str) -> BTreeMap<String, String> {
        self.find_in_text(command)
            .into_iter()
            .filter_map(|key| self.get(&key).map(|value| (key, value)))
            .collect()
    }

    /// Replace every known secret value in `text` with [`SECRET_MASK`]
    #[must_use]
    pub fn mask(&self, text: &str) -> String {
        let inner = self.inner.read();
        // Longest first so a secret containing another is masked whole
        let mut values: Vec<&String> = inner.resolved.iter().collect();
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        values
            .into_iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), SECRET_MASK))
    }
}
