//! Config Store
//!
//! The persisted key/value service holding tenant ids, mapping metadata
//! and per-tenant resource configuration. It is an external collaborator;
//! this module defines its contract and an in-memory implementation.

use crate::error::{Result, RouterError};
use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Key holding the JSON array of known tenant ids.
pub const TENANT_IDS_KEY: &str = "tenant_ids";

/// Key/value store contract.
///
/// Patterns passed to [`ConfigStore::iter_keys`] are globs: `*` matches
/// any run of characters and `?` exactly one.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Read a value, falling back to `default`.
    async fn get_or(&self, key: &str, default: Value) -> Result<Value> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    /// Write a value.
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove a key, reporting whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every key.
    async fn clear(&self) -> Result<()>;

    /// Keys matching a glob pattern.
    async fn iter_keys(&self, pattern: &str) -> Result<Vec<String>>;
}

impl<'a> dyn ConfigStore + 'a {
    /// Read and deserialize a value.
    pub async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Serialize and write a value.
    pub async fn set_typed<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, serde_json::to_value(value)?).await
    }
}

/// Compile a glob into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    let mut literal = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut literal))),
        }
    }
    expr.push('$');

    Regex::new(&expr).map_err(|e| RouterError::Store(format!("invalid key pattern {:?}: {}", pattern, e)))
}

/// In-memory config store
///
/// Suitable for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryConfigStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }

    async fn iter_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = glob_to_regex(pattern)?;
        Ok(self
            .entries
            .read()
            .keys()
            .filter(|key| matcher.is_match(key))
            .cloned()
            .collect())
    }
}
