//! # Tenant Router Redis
//!
//! Redis collaborators for the tenant router.
//!
//! ## Features
//!
//! - **Config Store**: JSON values over a bb8 connection pool, SCAN-based key iteration
//! - **Lifecycle Bus**: Pub/Sub backend with a single listener task and automatic resubscription
//! - **Configuration**: URL, credentials and pool sizing from code or environment
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tenant_router_core::{RouterSettings, TenantRouter};
//! use tenant_router_redis::{ListenerConfig, RedisConfig, RedisConfigStore, RedisPubSub};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = RouterSettings::load(None)?;
//!     let redis = RedisConfig::from_env().pool_size(8).build();
//!
//!     let store = RedisConfigStore::connect(redis.clone()).await?;
//!     let bus = RedisPubSub::new(&redis, ListenerConfig::from(&settings.pubsub))?;
//!
//!     let router = TenantRouter::builder(settings)
//!         .with_store(Arc::new(store))
//!         .with_backend(Arc::new(bus))
//!         .build()?;
//!
//!     router.start().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod pool;
mod pubsub;
mod store;

pub use config::{RedisConfig, RedisConfigBuilder};
pub use error::{RedisError, Result};
pub use pool::{RedisPool, RedisPoolBuilder};
pub use pubsub::{ListenerConfig, RedisPubSub};
pub use store::RedisConfigStore;

// Re-export redis types
pub use redis;

/// Prelude for common imports.
///
/// ```
/// use tenant_router_redis::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{RedisConfig, RedisConfigBuilder};
    pub use crate::error::{RedisError, Result};
    pub use crate::pool::RedisPool;
    pub use crate::pubsub::{ListenerConfig, RedisPubSub};
    pub use crate::store::RedisConfigStore;
}
