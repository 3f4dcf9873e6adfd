// Tenant Router - tenant context and resource routing for multi-tenant services
//
// This library resolves the tenant of every unit of work, routes logical
// resource names to tenant-specific connections and keeps every process of a
// fleet in sync through lifecycle events.

// Re-export core functionality
pub use tenant_router_core::*;

pub mod backend;

pub use backend::{Backend, builder_from_settings, config_store, pubsub_backend};

// Re-export the settings loader
pub use tenant_router_config;

// Re-export optional crates
#[cfg(feature = "redis")]
pub use tenant_router_redis;

// Prelude for common imports
pub mod prelude {
    pub use crate::backend::builder_from_settings;
    pub use crate::{
        ConfigStore,
        Connection,
        ConnectionFactory,
        ContextStack,
        DeployRequest,
        LifecycleEvent,
        LifecycleKind,
        LifecycleSubscriber,
        MemoryBroker,
        Migrator,
        RequestParts,
        ResourceConfig,
        Result,
        RouterError,
        RouterSettings,
        TenantAwareExecutor,
        TenantContext,
        TenantRouter,
        init_tracing,
    };

    #[cfg(feature = "redis")]
    pub use tenant_router_redis::{ListenerConfig, RedisConfig, RedisConfigStore, RedisPubSub};
}
