//! Tenant Management
//!
//! Administrative create/update/delete of tenants. Each operation writes
//! the config store first, applies the change to this process right away,
//! then broadcasts it so every other process picks it up at its next drain
//! point. The broadcast carries this process's id so the echo is ignored
//! here.

use crate::alias::AliasCodec;
use crate::error::{Result, RouterError};
use crate::lifecycle::{LifecycleEvent, LifecycleKind, ProcessId};
use crate::manager::{MigrationReport, MigrationScope, ResourceManager};
use crate::observer::LifecycleObserver;
use crate::resource::ResourceConfig;
use crate::store::{ConfigStore, TENANT_IDS_KEY};
use crate::tenant::TenantContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Deploy-info key → `<resource_kind>_<logical_name>`.
pub type MappingMetadata = BTreeMap<String, String>;

fn default_should_migrate() -> bool {
    true
}

/// Payload of a create or update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub deploy_info: BTreeMap<String, Value>,
    #[serde(default = "default_should_migrate")]
    pub should_migrate: bool,
}

impl DeployRequest {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            deploy_info: BTreeMap::new(),
            should_migrate: true,
        }
    }

    pub fn with_deploy(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.deploy_info.insert(key.into(), value.into());
        self
    }

    pub fn without_migration(mut self) -> Self {
        self.should_migrate = false;
        self
    }
}

/// What an administrative operation did.
#[derive(Debug)]
pub struct AdminOutcome {
    pub tenant: TenantContext,
    /// Resource aliases written or removed.
    pub aliases: Vec<String>,
    /// Channel the lifecycle event went out on.
    pub channel: String,
    /// Receivers the transport reported for the broadcast.
    pub receivers: usize,
    pub migration: Option<MigrationReport>,
}

pub(crate) struct PlannedResource {
    pub(crate) kind: String,
    pub(crate) alias: String,
    pub(crate) config: ResourceConfig,
}

/// Resolve every deploy key of one tenant to its alias and formatted config.
///
/// Runs before anything is written, so a bad key leaves the store untouched.
pub(crate) fn plan_resources(
    resources: &ResourceManager,
    mapping: &MappingMetadata,
    tenant: &TenantContext,
    deploy_info: &BTreeMap<String, Value>,
) -> Result<Vec<PlannedResource>> {
    let codec = resources.codec();
    let mut plan = Vec::with_capacity(deploy_info.len());

    for (key, raw) in deploy_info {
        let target = mapping.get(key).ok_or_else(|| {
            RouterError::Configuration(format!("deploy key {} has no mapping", key))
        })?;
        let (kind, logical_name) = codec.parse_target(target)?;
        let registry = resources.registry(&kind)?;
        if registry.reserved_aliases().contains(&logical_name) {
            return Err(RouterError::ReservedAliasViolation(logical_name));
        }
        registry.template_config(&logical_name)?;

        let alias = codec.construct(tenant.alias(), &kind, &logical_name)?;
        let config = registry.factory().format_config(raw)?;
        plan.push(PlannedResource { kind, alias, config });
    }

    Ok(plan)
}

/// Administrative handlers for tenant lifecycle.
pub struct TenantAdmin {
    store: Arc<dyn ConfigStore>,
    resources: Arc<ResourceManager>,
    observer: Arc<LifecycleObserver>,
    process: ProcessId,
}

impl TenantAdmin {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        resources: Arc<ResourceManager>,
        observer: Arc<LifecycleObserver>,
        process: ProcessId,
    ) -> Self {
        Self {
            store,
            resources,
            observer,
            process,
        }
    }

    fn codec(&self) -> &AliasCodec {
        self.resources.codec()
    }

    /// The deploy-info mapping document, empty when absent.
    pub async fn mapping(&self) -> Result<MappingMetadata> {
        let key = self.codec().mapping_metadata_key();
        Ok(self.store.get_typed(&key).await?.unwrap_or_default())
    }

    /// Tenant ids listed in the store.
    pub async fn tenant_ids(&self) -> Result<Vec<String>> {
        Ok(self.store.get_typed(TENANT_IDS_KEY).await?.unwrap_or_default())
    }

    /// Provision a tenant.
    pub async fn create(&self, request: DeployRequest) -> Result<AdminOutcome> {
        let tenant = self.tenant_for(&request.tenant_id)?;
        let plan = self.plan(&tenant, &request).await?;

        let mut ids = self.tenant_ids().await?;
        if !ids.contains(&request.tenant_id) {
            ids.push(request.tenant_id.clone());
            self.store.set_typed(TENANT_IDS_KEY, &ids).await?;
        }

        self.deploy(tenant, LifecycleKind::OnTenantCreate, plan, request.should_migrate)
            .await
    }

    /// Reconfigure a listed tenant.
    pub async fn update(&self, request: DeployRequest) -> Result<AdminOutcome> {
        let tenant = self.tenant_for(&request.tenant_id)?;
        if !self.tenant_ids().await?.contains(&request.tenant_id) {
            return Err(RouterError::TenantNotFound(request.tenant_id));
        }
        let plan = self.plan(&tenant, &request).await?;

        self.deploy(tenant, LifecycleKind::OnTenantUpdate, plan, request.should_migrate)
            .await
    }

    /// Remove a tenant and every resource config it owns.
    ///
    /// Returns `None` when the tenant is not listed; nothing is published then.
    pub async fn delete(&self, tenant_id: &str) -> Result<Option<AdminOutcome>> {
        let mut ids = self.tenant_ids().await?;
        let before = ids.len();
        ids.retain(|id| id != tenant_id);
        if ids.len() == before {
            debug!(tenant_id = %tenant_id, "Delete requested for unlisted tenant");
            return Ok(None);
        }
        self.store.set_typed(TENANT_IDS_KEY, &ids).await?;

        let tenant = TenantContext::new(tenant_id);
        let mut event = LifecycleEvent::new(tenant_id, LifecycleKind::OnTenantDelete);
        let mut aliases = Vec::new();

        for kind in self.resources.kinds() {
            let registry = self.resources.registry(kind)?;
            let pattern = format!("{}*", self.codec().kind_prefix(tenant.alias(), kind));
            for key in self.store.iter_keys(&pattern).await? {
                let config = match self.store.get(&key).await? {
                    Some(Value::Object(map)) => map,
                    Some(raw) => match registry.factory().format_config(&raw) {
                        Ok(config) => config,
                        Err(e) => {
                            // The alias is removed regardless; peers only need its key.
                            warn!(
                                tenant_id = %tenant_id,
                                alias = %key,
                                error = %e,
                                "Unreadable resource config; deleting without it"
                            );
                            ResourceConfig::new()
                        }
                    },
                    None => ResourceConfig::new(),
                };
                self.store.delete(&key).await?;
                event = event.with_resource(kind, key.clone(), config);
                aliases.push(key);
            }
        }

        self.observer.apply_local(&event).await?;
        let (channel, receivers) = self.publish(event).await?;

        info!(tenant_id = %tenant_id, aliases = aliases.len(), "Tenant deleted");
        Ok(Some(AdminOutcome {
            tenant,
            aliases,
            channel,
            receivers,
            migration: None,
        }))
    }

    fn tenant_for(&self, tenant_id: &str) -> Result<TenantContext> {
        let tenant = TenantContext::new(tenant_id);
        if tenant.is_empty() || tenant.is_base() {
            return Err(RouterError::InvalidContext(format!(
                "{:?} cannot be provisioned as a tenant",
                tenant_id
            )));
        }
        Ok(tenant)
    }

    async fn plan(&self, tenant: &TenantContext, request: &DeployRequest) -> Result<Vec<PlannedResource>> {
        let mapping = self.mapping().await?;
        plan_resources(&self.resources, &mapping, tenant, &request.deploy_info)
    }

    async fn deploy(
        &self,
        tenant: TenantContext,
        kind: LifecycleKind,
        plan: Vec<PlannedResource>,
        should_migrate: bool,
    ) -> Result<AdminOutcome> {
        let mut event = LifecycleEvent::new(tenant.id(), kind);
        let mut aliases = Vec::with_capacity(plan.len());

        for resource in plan {
            self.store
                .set(&resource.alias, Value::Object(resource.config.clone()))
                .await?;
            aliases.push(resource.alias.clone());
            event = event.with_resource(resource.kind, resource.alias, resource.config);
        }

        self.observer.apply_local(&event).await?;

        let migration = if should_migrate {
            let report = self
                .resources
                .migrate(&MigrationScope::Tenant(tenant.clone()))
                .await;
            if !report.is_success() {
                warn!(tenant_id = %tenant.id(), failed = report.failed(), "Tenant migration failed; publishing anyway");
            }
            Some(report)
        } else {
            None
        };

        let (channel, receivers) = self.publish(event).await?;

        info!(tenant_id = %tenant.id(), event = %kind, aliases = aliases.len(), "Tenant deployed");
        Ok(AdminOutcome {
            tenant,
            aliases,
            channel,
            receivers,
            migration,
        })
    }

    async fn publish(&self, event: LifecycleEvent) -> Result<(String, usize)> {
        let event = event.with_origin(self.process);
        let channel = event.channel(self.codec());
        let receivers = self
            .observer
            .proxy()
            .publish(&channel, &event.to_payload()?)
            .await?;
        Ok((channel, receivers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{MemoryBroker, MemoryPubSub, PubSubProxy};
    use crate::queue::DeferredEventQueue;
    use crate::resource::{Connection, ConnectionFactory, ResourceRegistry};
    use crate::store::InMemoryConfigStore;
    use crate::tenant::TenantRegistry;
    use async_trait::async_trait;
    use serde_json::json;

    struct NullConnection;

    #[async_trait]
    impl Connection for NullConnection {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct NullFactory;

    #[async_trait]
    impl ConnectionFactory for NullFactory {
        async fn connect(&self, _alias: &str, _config: &ResourceConfig) -> Result<Arc<dyn Connection>> {
            Ok(Arc::new(NullConnection))
        }
    }

    struct Fixture {
        admin: TenantAdmin,
        store: Arc<InMemoryConfigStore>,
        resources: Arc<ResourceManager>,
        tenants: Arc<TenantRegistry>,
    }

    async fn fixture() -> Fixture {
        let codec = Arc::new(AliasCodec::new("svc", ["relational-db"]).unwrap());
        let registry = ResourceRegistry::builder("relational-db", Arc::clone(&codec))
            .with_template("main", json!({"pool": 5}).as_object().cloned().unwrap())
            .with_template("control", ResourceConfig::new())
            .with_reserved("control")
            .with_factory(Arc::new(NullFactory))
            .build()
            .unwrap();
        let resources = Arc::new(
            ResourceManager::new(Arc::clone(&codec))
                .with_registry(registry)
                .unwrap(),
        );
        let tenants = Arc::new(TenantRegistry::new());

        let proxy = Arc::new(PubSubProxy::new(Arc::new(MemoryPubSub::new(MemoryBroker::default()))));
        let observer = LifecycleObserver::new(codec, proxy, Arc::new(DeferredEventQueue::default()));
        for kind in LifecycleKind::ALL {
            observer.subscribe(kind, resources.clone());
            observer.subscribe(kind, tenants.clone());
        }

        let store = Arc::new(InMemoryConfigStore::new());
        store
            .set(
                "svc_mapping_metadata",
                json!({"db_url": "relational-db_main", "ctl_url": "relational-db_control"}),
            )
            .await
            .unwrap();

        let admin = TenantAdmin::new(store.clone(), Arc::clone(&resources), observer, ProcessId::new());
        Fixture {
            admin,
            store,
            resources,
            tenants,
        }
    }

    #[tokio::test]
    async fn test_create_writes_applies_and_publishes() {
        let f = fixture().await;
        let outcome = f
            .admin
            .create(DeployRequest::new("acme.example.com").with_deploy("db_url", "proto://host/db"))
            .await
            .unwrap();

        assert_eq!(outcome.tenant.alias(), "acme_example_com");
        assert_eq!(outcome.aliases, vec!["acme_example_com_svc_relational-db_main"]);
        assert_eq!(outcome.channel, "on_tenant_create");

        let ids: Vec<String> = f.admin.tenant_ids().await.unwrap();
        assert_eq!(ids, vec!["acme.example.com"]);
        let stored = f.store.get("acme_example_com_svc_relational-db_main").await.unwrap().unwrap();
        assert_eq!(stored["host"], "host");

        let db = f.resources.registry("relational-db").unwrap();
        let config = db.config("acme_example_com_svc_relational-db_main").unwrap();
        assert_eq!(config["database"], "db");
        assert_eq!(config["pool"], 5);
        assert!(f.tenants.contains("acme.example.com"));
    }

    #[tokio::test]
    async fn test_create_twice_lists_tenant_once() {
        let f = fixture().await;
        for _ in 0..2 {
            f.admin.create(DeployRequest::new("acme")).await.unwrap();
        }
        assert_eq!(f.admin.tenant_ids().await.unwrap(), vec!["acme"]);
    }

    #[tokio::test]
    async fn test_create_validates_before_writing() {
        let f = fixture().await;

        let unmapped = DeployRequest::new("acme")
            .with_deploy("db_url", "proto://host/db")
            .with_deploy("mystery", "x");
        assert!(matches!(
            f.admin.create(unmapped).await,
            Err(RouterError::Configuration(_))
        ));

        let reserved = DeployRequest::new("acme").with_deploy("ctl_url", "proto://host/ctl");
        assert!(matches!(
            f.admin.create(reserved).await,
            Err(RouterError::ReservedAliasViolation(_))
        ));

        assert!(f.admin.tenant_ids().await.unwrap().is_empty());
        assert!(f.store.iter_keys("acme_*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_requires_listed_tenant() {
        let f = fixture().await;
        let result = f.admin.update(DeployRequest::new("globex")).await;
        assert!(matches!(result, Err(RouterError::TenantNotFound(_))));
    }

    #[tokio::test]
    async fn test_update_replaces_config() {
        let f = fixture().await;
        f.admin
            .create(DeployRequest::new("acme").with_deploy("db_url", "proto://old/db"))
            .await
            .unwrap();
        let outcome = f
            .admin
            .update(DeployRequest::new("acme").with_deploy("db_url", "proto://new/db"))
            .await
            .unwrap();

        assert_eq!(outcome.channel, "acme_svc_on_tenant_update");
        let db = f.resources.registry("relational-db").unwrap();
        assert_eq!(db.config("acme_svc_relational-db_main").unwrap()["host"], "new");
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let f = fixture().await;
        f.admin
            .create(DeployRequest::new("acme.example.com").with_deploy("db_url", "proto://host/db"))
            .await
            .unwrap();

        let outcome = f.admin.delete("acme.example.com").await.unwrap().unwrap();
        assert_eq!(outcome.channel, "acme_example_com_svc_on_tenant_delete");
        assert_eq!(outcome.aliases, vec!["acme_example_com_svc_relational-db_main"]);

        assert!(f.admin.tenant_ids().await.unwrap().is_empty());
        assert!(f.store.get("acme_example_com_svc_relational-db_main").await.unwrap().is_none());
        let db = f.resources.registry("relational-db").unwrap();
        assert!(!db.contains("acme_example_com_svc_relational-db_main"));
        assert!(!f.tenants.contains("acme.example.com"));

        assert!(f.admin.delete("acme.example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_tolerates_unreadable_stored_config() {
        let f = fixture().await;
        f.admin
            .create(DeployRequest::new("acme").with_deploy("db_url", "proto://host/db"))
            .await
            .unwrap();
        f.store.set("acme_svc_relational-db_main", json!(42)).await.unwrap();

        let outcome = f.admin.delete("acme").await.unwrap().unwrap();
        assert_eq!(outcome.aliases, vec!["acme_svc_relational-db_main"]);

        assert!(f.store.get("acme_svc_relational-db_main").await.unwrap().is_none());
        let db = f.resources.registry("relational-db").unwrap();
        assert!(!db.contains("acme_svc_relational-db_main"));
        assert!(!f.tenants.contains("acme"));
    }

    #[tokio::test]
    async fn test_base_tenant_cannot_be_provisioned() {
        let f = fixture().await;
        let result = f.admin.create(DeployRequest::new("__base__")).await;
        assert!(matches!(result, Err(RouterError::InvalidContext(_))));
    }

    #[test]
    fn test_request_defaults() {
        let request: DeployRequest = serde_json::from_value(json!({"tenant_id": "acme"})).unwrap();
        assert!(request.should_migrate);
        assert!(request.deploy_info.is_empty());
    }
}
