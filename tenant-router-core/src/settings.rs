//! Router settings.
//!
//! Layered through [`ConfigManager`]: a JSON or TOML file, then `.env`,
//! then `TENANT_ROUTER_*` environment variables (`__` nests, so
//! `TENANT_ROUTER_PUBSUB__BACKEND=redis` sets `pubsub.backend`).

use crate::alias::AliasCodec;
use crate::error::{Result, RouterError};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::resolver::DEFAULT_TENANT_HEADER;
use crate::resource::ResourceConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tenant_router_config::{ConfigError, ConfigManager, ConfigValidator, Validate};

/// Environment variable prefix for settings overrides.
pub const ENV_PREFIX: &str = "TENANT_ROUTER";

/// Settings that stay strings even when an environment value looks numeric.
pub const STRING_KEYS: [&str; 8] = [
    "service_name",
    "pubsub.backend",
    "pubsub.url",
    "config_store.backend",
    "config_store.url",
    "middleware.header",
    "logging.level",
    "logging.format",
];

/// Backends selectable by name.
pub const BACKENDS: [&str; 2] = ["memory", "redis"];

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Complete settings of one router process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Second component of every resource alias. Must not contain `_`.
    pub service_name: String,

    /// Resource kind → templates and reserved names.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceKindSettings>,

    #[serde(default)]
    pub pubsub: PubSubSettings,

    #[serde(default)]
    pub config_store: ConfigStoreSettings,

    #[serde(default)]
    pub middleware: MiddlewareSettings,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub logging: LogSettings,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl RouterSettings {
    /// Settings with defaults everywhere but the service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            resources: BTreeMap::new(),
            pubsub: PubSubSettings::default(),
            config_store: ConfigStoreSettings::default(),
            middleware: MiddlewareSettings::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            logging: LogSettings::default(),
        }
    }

    /// Declare one template of a resource kind.
    pub fn with_template(
        mut self,
        kind: impl Into<String>,
        logical_name: impl Into<String>,
        config: ResourceConfig,
    ) -> Self {
        self.resources
            .entry(kind.into())
            .or_default()
            .templates
            .insert(logical_name.into(), config);
        self
    }

    /// Mark a template of `kind` as reserved.
    pub fn with_reserved(mut self, kind: impl Into<String>, logical_name: impl Into<String>) -> Self {
        self.resources
            .entry(kind.into())
            .or_default()
            .reserved
            .push(logical_name.into());
        self
    }

    /// Load from an optional file, `.env` and the environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let manager = ConfigManager::with_prefix(ENV_PREFIX).with_string_keys(STRING_KEYS);
        if let Some(path) = path {
            manager.load_file(path)?;
        }
        manager.load_dotenv(None)?;
        Self::from_manager(&manager)
    }

    /// Deserialize and validate whatever `manager` has accumulated.
    pub fn from_manager(manager: &ConfigManager) -> Result<Self> {
        manager
            .load_validated()
            .map_err(|e| RouterError::Configuration(e.to_string()))
    }

    /// The alias codec these settings describe.
    pub fn codec(&self) -> Result<AliasCodec> {
        AliasCodec::new(self.service_name.clone(), self.resources.keys().cloned())
    }
}

impl Validate for RouterSettings {
    fn validate(&self) -> tenant_router_config::Result<()> {
        ConfigValidator::not_empty(&self.service_name, "service_name")?;
        ConfigValidator::excludes(&self.service_name, '_', "service_name")?;

        for (kind, resource) in &self.resources {
            ConfigValidator::not_empty(kind, "resources.<kind>")?;
            ConfigValidator::excludes(kind, '_', "resources.<kind>")?;
            if resource.templates.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "resources.{} declares no templates",
                    kind
                )));
            }
            if let Some(name) = resource
                .reserved
                .iter()
                .find(|name| !resource.templates.contains_key(*name))
            {
                return Err(ConfigError::ValidationError(format!(
                    "resources.{}.reserved names {:?}, which is not a template",
                    kind, name
                )));
            }
        }

        ConfigValidator::in_range(self.queue_capacity, 1, 100_000, "queue_capacity")?;
        self.pubsub.validate()?;
        self.config_store.validate()?;
        ConfigValidator::not_empty(&self.middleware.header, "middleware.header")?;
        ConfigValidator::one_of(&self.logging.level.as_str(), &LOG_LEVELS, "logging.level")?;

        Ok(())
    }
}

/// Templates and reserved names of one resource kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceKindSettings {
    #[serde(default)]
    pub templates: BTreeMap<String, ResourceConfig>,
    #[serde(default)]
    pub reserved: Vec<String>,
}

/// Lifecycle bus settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubSettings {
    pub enabled: bool,
    pub backend: String,
    pub url: Option<String>,
    /// Messages read per burst before idling.
    pub read_burst: usize,
    pub idle_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for PubSubSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: "memory".to_string(),
            url: None,
            read_burst: 5,
            idle_ms: 1000,
            read_timeout_ms: 1000,
        }
    }
}

impl PubSubSettings {
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Validate for PubSubSettings {
    fn validate(&self) -> tenant_router_config::Result<()> {
        ConfigValidator::one_of(&self.backend.as_str(), &BACKENDS, "pubsub.backend")?;
        validate_backend_url(&self.backend, self.url.as_deref(), "pubsub.url")?;
        ConfigValidator::in_range(self.read_burst, 1, 1000, "pubsub.read_burst")?;
        ConfigValidator::in_range(self.read_timeout_ms, 1, 60_000, "pubsub.read_timeout_ms")?;
        Ok(())
    }
}

/// Config store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigStoreSettings {
    pub backend: String,
    pub url: Option<String>,
}

impl Default for ConfigStoreSettings {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            url: None,
        }
    }
}

impl Validate for ConfigStoreSettings {
    fn validate(&self) -> tenant_router_config::Result<()> {
        ConfigValidator::one_of(&self.backend.as_str(), &BACKENDS, "config_store.backend")?;
        validate_backend_url(&self.backend, self.url.as_deref(), "config_store.url")
    }
}

fn validate_backend_url(backend: &str, url: Option<&str>, field: &str) -> tenant_router_config::Result<()> {
    match (backend, url) {
        ("redis", Some(url)) => ConfigValidator::is_url(url, &["redis", "rediss"], field),
        ("redis", None) => Err(ConfigError::ValidationError(format!(
            "{} is required for the redis backend",
            field
        ))),
        _ => Ok(()),
    }
}

/// Request boundary settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareSettings {
    /// Header carrying the tenant id.
    pub header: String,
    /// Paths served under the base tenant.
    pub whitelist: Vec<String>,
}

impl Default for MiddlewareSettings {
    fn default() -> Self {
        Self {
            header: DEFAULT_TENANT_HEADER.to_string(),
            whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
