//! Router assembly.
//!
//! [`TenantRouter`] wires every component of one process from
//! [`RouterSettings`], a config store, a pub/sub backend and one connection
//! factory per resource kind.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tenant_router_core::{RouterSettings, TenantRouter};
//! # use tenant_router_core::resource::ConnectionFactory;
//! # async fn run(postgres: Arc<dyn ConnectionFactory>) -> tenant_router_core::Result<()> {
//! let settings = RouterSettings::load(None)?;
//! let router = TenantRouter::builder(settings)
//!     .with_factory("relational-db", postgres)
//!     .build()?;
//!
//! router.start().await?;
//! // ... serve requests through router.scope() ...
//! router.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::admin::TenantAdmin;
use crate::alias::AliasCodec;
use crate::error::{Result, RouterError};
use crate::executor::TenantAwareExecutor;
use crate::lifecycle::{LifecycleKind, LifecycleSubscriber, ProcessFilter, ProcessId};
use crate::manager::ResourceManager;
use crate::observer::LifecycleObserver;
use crate::pubsub::{MemoryBroker, MemoryPubSub, PubSubBackend, PubSubProxy};
use crate::queue::{DeferredEventQueue, DrainReport};
use crate::resolver::{HeaderTenantIdResolver, RequestParts, TenantIdResolver};
use crate::resource::{ConnectionFactory, HealthStatus, Migrator, ResourceRegistry};
use crate::scope::TenantScope;
use crate::seed::ConfigSeeder;
use crate::settings::RouterSettings;
use crate::store::{ConfigStore, InMemoryConfigStore};
use crate::tenant::TenantRegistry;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tenant_router_config::Validate;
use tracing::{info, warn};

const TENANT_EVENTS: [LifecycleKind; 3] = [
    LifecycleKind::OnTenantCreate,
    LifecycleKind::OnTenantUpdate,
    LifecycleKind::OnTenantDelete,
];

/// Builder for [`TenantRouter`].
pub struct TenantRouterBuilder {
    settings: RouterSettings,
    store: Option<Arc<dyn ConfigStore>>,
    backend: Option<Arc<dyn PubSubBackend>>,
    factories: HashMap<String, Arc<dyn ConnectionFactory>>,
    migrators: HashMap<String, Arc<dyn Migrator>>,
    resolver: Option<Arc<dyn TenantIdResolver>>,
    process: Option<ProcessId>,
}

impl TenantRouterBuilder {
    /// Config store shared with the rest of the fleet. Defaults to an in-memory store.
    pub fn with_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Lifecycle transport. Defaults to a private in-memory broker.
    pub fn with_backend(mut self, backend: Arc<dyn PubSubBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Connection factory of one resource kind. Every declared kind needs one.
    pub fn with_factory(mut self, kind: impl Into<String>, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factories.insert(kind.into(), factory);
        self
    }

    pub fn with_migrator(mut self, kind: impl Into<String>, migrator: Arc<dyn Migrator>) -> Self {
        self.migrators.insert(kind.into(), migrator);
        self
    }

    /// Tenant id resolver. Defaults to the configured header.
    pub fn with_resolver(mut self, resolver: Arc<dyn TenantIdResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_process(mut self, process: ProcessId) -> Self {
        self.process = Some(process);
        self
    }

    pub fn build(mut self) -> Result<TenantRouter> {
        let settings = self.settings;
        settings
            .validate()
            .map_err(|e| RouterError::Configuration(e.to_string()))?;

        if let Some(kind) = self
            .factories
            .keys()
            .chain(self.migrators.keys())
            .find(|kind| !settings.resources.contains_key(*kind))
        {
            return Err(RouterError::Configuration(format!(
                "resource kind {} is not declared in settings",
                kind
            )));
        }

        let codec = Arc::new(settings.codec()?);
        let mut resources = ResourceManager::new(Arc::clone(&codec));
        for (kind, declared) in &settings.resources {
            let factory = self.factories.remove(kind).ok_or_else(|| {
                RouterError::Configuration(format!("no connection factory for resource kind {}", kind))
            })?;
            let mut builder = ResourceRegistry::builder(kind.clone(), Arc::clone(&codec))
                .with_templates(declared.templates.clone())
                .with_factory(factory);
            for name in &declared.reserved {
                builder = builder.with_reserved(name.clone());
            }
            if let Some(migrator) = self.migrators.remove(kind) {
                builder = builder.with_migrator(migrator);
            }
            resources = resources.with_registry(builder.build()?)?;
        }
        let resources = Arc::new(resources);

        let process = self.process.unwrap_or_default();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryConfigStore::new()));
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryPubSub::new(MemoryBroker::default())));

        let queue = Arc::new(DeferredEventQueue::new(settings.queue_capacity));
        let proxy = Arc::new(PubSubProxy::new(backend));
        let observer = LifecycleObserver::new(Arc::clone(&codec), proxy, Arc::clone(&queue));

        // Registered last, so resources run before the tenant registry.
        let tenants = Arc::new(TenantRegistry::new());
        let tenant_subscriber: Arc<dyn LifecycleSubscriber> =
            Arc::new(ProcessFilter::new(tenants.clone(), process));
        let resource_subscriber: Arc<dyn LifecycleSubscriber> =
            Arc::new(ProcessFilter::new(resources.clone(), process));
        for kind in TENANT_EVENTS {
            observer.subscribe(kind, Arc::clone(&tenant_subscriber));
            observer.subscribe(kind, Arc::clone(&resource_subscriber));
        }

        let resolver = self.resolver.unwrap_or_else(|| {
            Arc::new(HeaderTenantIdResolver::new(settings.middleware.header.clone()))
        });
        let scope = TenantScope::new(resolver, Arc::clone(&tenants), Arc::clone(&queue))
            .with_whitelist(settings.middleware.whitelist.iter().cloned());
        let admin = TenantAdmin::new(
            Arc::clone(&store),
            Arc::clone(&resources),
            Arc::clone(&observer),
            process,
        );
        let executor = TenantAwareExecutor::with_registry(Arc::clone(&tenants));

        Ok(TenantRouter {
            settings,
            process,
            codec,
            store,
            tenants,
            resources,
            observer,
            scope,
            admin,
            executor,
        })
    }
}

/// Every component of one router process.
pub struct TenantRouter {
    settings: RouterSettings,
    process: ProcessId,
    codec: Arc<AliasCodec>,
    store: Arc<dyn ConfigStore>,
    tenants: Arc<TenantRegistry>,
    resources: Arc<ResourceManager>,
    observer: Arc<LifecycleObserver>,
    scope: TenantScope,
    admin: TenantAdmin,
    executor: TenantAwareExecutor,
}

impl TenantRouter {
    pub fn builder(settings: RouterSettings) -> TenantRouterBuilder {
        TenantRouterBuilder {
            settings,
            store: None,
            backend: None,
            factories: HashMap::new(),
            migrators: HashMap::new(),
            resolver: None,
            process: None,
        }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn codec(&self) -> &Arc<AliasCodec> {
        &self.codec
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn tenants(&self) -> &Arc<TenantRegistry> {
        &self.tenants
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Registry of one resource kind.
    pub fn registry(&self, kind: &str) -> Result<&Arc<ResourceRegistry>> {
        self.resources.registry(kind)
    }

    pub fn observer(&self) -> &Arc<LifecycleObserver> {
        &self.observer
    }

    pub fn queue(&self) -> &Arc<DeferredEventQueue> {
        self.observer.queue()
    }

    pub fn proxy(&self) -> &Arc<PubSubProxy> {
        self.observer.proxy()
    }

    pub fn scope(&self) -> &TenantScope {
        &self.scope
    }

    pub fn admin(&self) -> &TenantAdmin {
        &self.admin
    }

    pub fn executor(&self) -> &TenantAwareExecutor {
        &self.executor
    }

    pub fn seeder(&self) -> ConfigSeeder {
        ConfigSeeder::new(Arc::clone(&self.store), Arc::clone(&self.resources))
    }

    /// Add an application subscriber. It runs before every earlier one.
    pub fn subscribe(&self, kind: LifecycleKind, subscriber: Arc<dyn LifecycleSubscriber>) {
        self.observer.subscribe(kind, subscriber);
    }

    /// Load tenants, bootstrap resources and start listening for lifecycle events.
    pub async fn start(&self) -> Result<()> {
        self.tenants.load(self.store.as_ref()).await?;
        let tenants = self.tenants.all();
        self.resources.bootstrap(self.store.as_ref(), &tenants).await?;

        if self.settings.pubsub.enabled {
            self.observer.observe(&tenants).await?;
            self.proxy().listen().await?;
        } else {
            warn!("Lifecycle bus disabled; changes from other processes will not be seen");
        }

        info!(
            process = %self.process,
            service = %self.codec.service_name(),
            tenants = tenants.len(),
            "Tenant router started"
        );
        Ok(())
    }

    /// Stop listening and close every live connection.
    pub async fn shutdown(&self) {
        if self.proxy().backend().is_running()
            && let Err(e) = self.proxy().shutdown().await
        {
            warn!(error = %e, "Failed to stop lifecycle listener");
        }
        self.resources.close_all().await;
        info!(process = %self.process, "Tenant router stopped");
    }

    /// See [`TenantScope::run_request`].
    pub async fn run_request<F: Future>(&self, request: &RequestParts, work: F) -> Result<F::Output> {
        self.scope.run_request(request, work).await
    }

    /// See [`TenantScope::run_task`].
    pub async fn run_task<F: Future>(&self, tenant_id: &str, work: F) -> Result<F::Output> {
        self.scope.run_task(tenant_id, work).await
    }

    pub async fn drain(&self) -> DrainReport {
        self.scope.drain().await
    }

    /// Drain pending lifecycle work, then probe every resource.
    pub async fn health_check(&self) -> BTreeMap<String, BTreeMap<String, HealthStatus>> {
        self.drain().await;
        self.resources.health_check().await
    }
}
