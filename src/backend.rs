//! Collaborator selection from settings.
//!
//! `config_store.backend` and `pubsub.backend` name the transport each
//! process uses. `memory` works everywhere; `redis` needs the `redis`
//! feature.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tenant_router_core::{
    ConfigStore, ConfigStoreSettings, InMemoryConfigStore, MemoryBroker, MemoryPubSub,
    PubSubBackend, PubSubSettings, Result, RouterError, RouterSettings, TenantRouter,
    TenantRouterBuilder,
};
use tracing::info;

/// Supported collaborator backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Redis,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(RouterError::Configuration(format!("unknown backend {:?}", other))),
        }
    }
}

#[cfg(feature = "redis")]
fn redis_config(url: Option<&str>, setting: &str) -> Result<tenant_router_redis::RedisConfig> {
    let url = url.ok_or_else(|| RouterError::Configuration(format!("{} is required for redis", setting)))?;
    Ok(tenant_router_redis::RedisConfig::new(url))
}

#[cfg(not(feature = "redis"))]
fn redis_unavailable(setting: &str) -> RouterError {
    RouterError::Configuration(format!(
        "{} selects redis but this build lacks the redis feature",
        setting
    ))
}

/// Open the config store named by `settings`.
pub async fn config_store(settings: &ConfigStoreSettings) -> Result<Arc<dyn ConfigStore>> {
    match settings.backend.parse::<Backend>()? {
        Backend::Memory => Ok(Arc::new(InMemoryConfigStore::new())),
        #[cfg(feature = "redis")]
        Backend::Redis => {
            let config = redis_config(settings.url.as_deref(), "config_store.url")?;
            let store = tenant_router_redis::RedisConfigStore::connect(config).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Backend::Redis => Err(redis_unavailable("config_store.backend")),
    }
}

/// Create the lifecycle transport named by `settings`.
///
/// Memory transports attach to `broker`, so routers sharing one broker see
/// each other's events.
pub fn pubsub_backend(settings: &PubSubSettings, broker: &MemoryBroker) -> Result<Arc<dyn PubSubBackend>> {
    match settings.backend.parse::<Backend>()? {
        Backend::Memory => Ok(Arc::new(MemoryPubSub::new(broker.clone()))),
        #[cfg(feature = "redis")]
        Backend::Redis => {
            let config = redis_config(settings.url.as_deref(), "pubsub.url")?;
            let bus = tenant_router_redis::RedisPubSub::new(
                &config,
                tenant_router_redis::ListenerConfig::from(settings),
            )?;
            Ok(Arc::new(bus))
        }
        #[cfg(not(feature = "redis"))]
        Backend::Redis => Err(redis_unavailable("pubsub.backend")),
    }
}

/// A [`TenantRouterBuilder`] with the store and transport chosen by `settings`.
///
/// Connection factories still have to be added per resource kind.
pub async fn builder_from_settings(settings: RouterSettings, broker: &MemoryBroker) -> Result<TenantRouterBuilder> {
    let store = config_store(&settings.config_store).await?;
    let backend = pubsub_backend(&settings.pubsub, broker)?;

    info!(
        config_store = %settings.config_store.backend,
        pubsub = %settings.pubsub.backend,
        "Collaborators selected"
    );

    Ok(TenantRouter::builder(settings)
        .with_store(store)
        .with_backend(backend))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!("memory".parse::<Backend>().unwrap(), Backend::Memory);
        assert_eq!("redis".parse::<Backend>().unwrap(), Backend::Redis);
        assert!(matches!(
            "etcd".parse::<Backend>(),
            Err(RouterError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_collaborators() {
        let broker = MemoryBroker::default();
        let store = config_store(&ConfigStoreSettings::default()).await.unwrap();
        assert!(store.iter_keys("*").await.unwrap().is_empty());

        let backend = pubsub_backend(&PubSubSettings::default(), &broker).unwrap();
        assert_eq!(backend.name(), "memory");
        assert_eq!(broker.receiver_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_backend_rejected() {
        let settings = ConfigStoreSettings {
            backend: "etcd".to_string(),
            url: None,
        };
        assert!(matches!(
            config_store(&settings).await,
            Err(RouterError::Configuration(_))
        ));
    }

    #[cfg(not(feature = "redis"))]
    #[test]
    fn test_redis_requires_feature() {
        let settings = PubSubSettings {
            backend: "redis".to_string(),
            url: Some("redis://localhost:6379".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            pubsub_backend(&settings, &MemoryBroker::default()),
            Err(RouterError::Configuration(_))
        ));
    }
}
