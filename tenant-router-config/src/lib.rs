//! Layered settings for tenant-router.
//!
//! A [`ConfigManager`] accumulates layers in the order they are loaded;
//! later layers win key by key, nested tables merge recursively:
//!
//! ```no_run
//! use tenant_router_config::ConfigManager;
//!
//! let manager = ConfigManager::with_prefix("TENANT_ROUTER");
//! manager.load_file("router.toml")?;
//! manager.load_dotenv(None)?;
//! let service: String = manager.get("service_name")?;
//! # Ok::<(), tenant_router_config::ConfigError>(())
//! ```

pub mod env;
pub mod error;
pub mod loader;
pub mod validation;

pub use env::EnvLoader;
pub use error::{ConfigError, Result};
pub use loader::{deep_merge, ConfigLoader, FileFormat};
pub use validation::{ConfigValidator, Validate};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

/// Main configuration manager
#[derive(Clone, Default)]
pub struct ConfigManager {
    config: Arc<RwLock<Map<String, Value>>>,
    env_prefix: Option<String>,
    env_string_keys: Vec<String>,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with environment variable prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            config: Arc::default(),
            env_prefix: Some(prefix.into()),
            env_string_keys: Vec::new(),
        }
    }

    /// Keep these dotted key paths as strings when read from the environment.
    pub fn with_string_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env_string_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Merge a settings file, format taken from its extension.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let layer = ConfigLoader::auto(path.as_ref())?.load_file(path)?;
        self.merge_layer(layer);
        Ok(())
    }

    /// Merge settings from an in-memory document.
    pub fn load_str(&self, content: &str, format: FileFormat) -> Result<()> {
        let layer = ConfigLoader::new(format).parse(content)?;
        self.merge_layer(layer);
        Ok(())
    }

    /// Merge prefixed environment variables.
    pub fn load_env(&self) -> Result<()> {
        let layer = EnvLoader::new(self.env_prefix.clone())
            .with_string_keys(self.env_string_keys.iter().cloned())
            .load_nested();
        self.merge_layer(layer);
        Ok(())
    }

    /// Export a `.env` file into the process environment, then merge the environment.
    pub fn load_dotenv(&self, path: Option<&str>) -> Result<()> {
        if let Some(path) = path {
            dotenvy::from_path(path).map_err(|e| ConfigError::LoadError {
                source_name: path.to_string(),
                reason: e.to_string(),
            })?;
        } else {
            dotenvy::dotenv().ok(); // Ignore if .env doesn't exist
        }
        self.load_env()
    }

    /// Merge an arbitrary object layer.
    pub fn merge_layer(&self, layer: Map<String, Value>) {
        deep_merge(&mut self.config.write(), layer);
    }

    /// Set a value at a dotted key path, creating intermediate tables.
    pub fn set<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| ConfigError::DeserializationError(e.to_string()))?;

        let mut layer = Map::new();
        let mut segments = key.split('.').rev();
        if let Some(leaf) = segments.next() {
            layer.insert(leaf.to_string(), value);
        }
        for parent in segments {
            let mut wrapped = Map::new();
            wrapped.insert(parent.to_string(), Value::Object(layer));
            layer = wrapped;
        }

        self.merge_layer(layer);
        Ok(())
    }

    /// Get a value at a dotted key path.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .lookup(key)
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))?;

        serde_json::from_value(value).map_err(|e| ConfigError::DeserializationError(e.to_string()))
    }

    /// Get a configuration value with default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Check if a key exists
    pub fn has(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Top-level keys currently present.
    pub fn keys(&self) -> Vec<String> {
        self.config.read().keys().cloned().collect()
    }

    /// Snapshot of the merged tree.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.config.read().clone())
    }

    /// Deserialize the merged tree into `T` and run its validation rules.
    pub fn load_validated<T: DeserializeOwned + Validate>(&self) -> Result<T> {
        let settings: T = serde_json::from_value(self.snapshot())
            .map_err(|e| ConfigError::DeserializationError(e.to_string()))?;

        settings.validate()?;

        Ok(settings)
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        let config = self.config.read();
        let mut segments = key.split('.');
        let mut current = config.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get_dotted() {
        let manager = ConfigManager::new();
        manager.set("pubsub.backend", "redis").unwrap();
        manager.set("pubsub.read_burst", 5).unwrap();

        let backend: String = manager.get("pubsub.backend").unwrap();
        assert_eq!(backend, "redis");
        assert_eq!(manager.get::<u32>("pubsub.read_burst").unwrap(), 5);
    }

    #[test]
    fn test_get_or_default() {
        let manager = ConfigManager::new();

        let value: String = manager.get_or("missing_key", "default_value".to_string());
        assert_eq!(value, "default_value");
    }

    #[test]
    fn test_has_key() {
        let manager = ConfigManager::new();
        manager.set("middleware.header", "x-tenant-id").unwrap();

        assert!(manager.has("middleware"));
        assert!(manager.has("middleware.header"));
        assert!(!manager.has("middleware.whitelist"));
    }

    #[test]
    fn test_later_layers_win() {
        let manager = ConfigManager::new();
        manager
            .load_str(
                r#"
                    service_name = "svc"
                    [pubsub]
                    backend = "memory"
                    read_burst = 5
                "#,
                FileFormat::Toml,
            )
            .unwrap();
        manager
            .load_str(r#"{"pubsub": {"backend": "redis"}}"#, FileFormat::Json)
            .unwrap();

        assert_eq!(manager.get::<String>("pubsub.backend").unwrap(), "redis");
        assert_eq!(manager.get::<u32>("pubsub.read_burst").unwrap(), 5);
        assert_eq!(manager.get::<String>("service_name").unwrap(), "svc");
    }
}
