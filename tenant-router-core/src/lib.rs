//! Tenant Context & Resource Routing
//!
//! Lets a fleet of identical, stateless worker processes serve many
//! isolated tenants from shared infrastructure. Every unit of work is bound
//! to one tenant, and every resource lookup made during it resolves to that
//! tenant's backing resource, from registries that follow tenant creation,
//! reconfiguration and removal anywhere in the fleet without restarts.
//!
//! # Features
//!
//! - 🧭 **Task-local tenant context** - [`ContextStack`] scoped per request or task
//! - 🔑 **Resource aliases** - `<tenant>_<service>_<kind>_<logical_name>` via [`AliasCodec`]
//! - 🗄️ **Per-kind registries** - lazy connections, template merge, reserved aliases
//! - 📡 **Lifecycle propagation** - create/update/delete broadcast over a pluggable bus
//! - ⏳ **Deferred application** - remote changes applied only at drain points
//! - 🔁 **Self-event suppression** - the originating process skips its own echo
//! - 🧵 **Executor propagation** - spawned work inherits the submitting tenant
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tenant_router_core::prelude::*;
//!
//! let settings = RouterSettings::load(Some("router.toml".as_ref()))?;
//! init_tracing(&settings.logging)?;
//!
//! let router = TenantRouter::builder(settings)
//!     .with_store(store)
//!     .with_backend(backend)
//!     .with_factory("relational-db", Arc::new(PostgresFactory::new()))
//!     .build()?;
//! router.start().await?;
//!
//! // Per request: drain, bind the tenant, run, unbind, drain.
//! let rows = router
//!     .run_request(&request, async {
//!         let db = router.registry("relational-db")?;
//!         let conn = db.current_connection("main").await?;
//!         query(conn).await
//!     })
//!     .await??;
//!
//! // Administrative create, applied here and broadcast to every process.
//! router
//!     .admin()
//!     .create(DeployRequest::new("acme.example.com").with_deploy("db_url", "postgres://..."))
//!     .await?;
//! ```

pub mod admin;
pub mod alias;
pub mod context;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod logging;
pub mod manager;
pub mod observer;
pub mod pubsub;
pub mod queue;
pub mod resolver;
pub mod resource;
pub mod router;
pub mod scope;
pub mod seed;
pub mod settings;
pub mod store;
pub mod tenant;

pub use admin::{AdminOutcome, DeployRequest, MappingMetadata, TenantAdmin};
pub use alias::{AliasCodec, AliasParts};
pub use context::{ContextStack, PopGuard};
pub use error::{DeconstructionError, Result, RouterError};
pub use executor::TenantAwareExecutor;
pub use lifecycle::{
    LifecycleEvent, LifecycleKind, LifecycleSubscriber, ProcessFilter, ProcessId, ResourceChanges,
};
pub use logging::init_tracing;
pub use manager::{MigrationReport, MigrationScope, ResourceManager};
pub use observer::LifecycleObserver;
pub use pubsub::{
    ChannelHandler, ChannelKind, MemoryBroker, MemoryPubSub, MessageSink, NormalizedEvent,
    PubSubBackend, PubSubProxy, RawMessage,
};
pub use queue::{DeferredEvent, DeferredEventQueue, DrainReport, DEFAULT_QUEUE_CAPACITY};
pub use resolver::{
    HeaderTenantIdResolver, PathTenantIdResolver, RequestParts, SubdomainTenantIdResolver,
    TenantIdResolver,
};
pub use resource::{
    Connection, ConnectionFactory, HealthStatus, Migrator, ResourceConfig, ResourceRegistry,
    ResourceRegistryBuilder,
};
pub use router::{TenantRouter, TenantRouterBuilder};
pub use scope::TenantScope;
pub use seed::{ConfigSeeder, SeedDocument, SeedOptions, SeedReport};
pub use settings::{
    ConfigStoreSettings, LogFormat, LogSettings, MiddlewareSettings, PubSubSettings,
    ResourceKindSettings, RouterSettings,
};
pub use store::{ConfigStore, InMemoryConfigStore, TENANT_IDS_KEY};
pub use tenant::{TenantContext, TenantRegistry, BASE_TENANT_ID};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::admin::{DeployRequest, TenantAdmin};
    pub use crate::context::ContextStack;
    pub use crate::error::{Result, RouterError};
    pub use crate::executor::TenantAwareExecutor;
    pub use crate::lifecycle::{LifecycleEvent, LifecycleKind, LifecycleSubscriber, ProcessId};
    pub use crate::logging::init_tracing;
    pub use crate::pubsub::{MemoryBroker, MemoryPubSub, PubSubBackend};
    pub use crate::resolver::{RequestParts, TenantIdResolver};
    pub use crate::resource::{Connection, ConnectionFactory, Migrator, ResourceConfig};
    pub use crate::router::TenantRouter;
    pub use crate::settings::RouterSettings;
    pub use crate::store::{ConfigStore, InMemoryConfigStore};
    pub use crate::tenant::{TenantContext, TenantRegistry};
}
