//! Resource Manager
//!
//! Groups one [`ResourceRegistry`] per declared resource kind and drives
//! them together: bootstrap from the config store, lifecycle events,
//! health reporting, migration and shutdown.

use crate::alias::AliasCodec;
use crate::error::{Result, RouterError};
use crate::lifecycle::{LifecycleEvent, LifecycleKind, LifecycleSubscriber};
use crate::resource::{HealthStatus, ResourceConfig, ResourceRegistry};
use crate::store::ConfigStore;
use crate::tenant::TenantContext;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which aliases a migration run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationScope {
    /// Every registered alias of one tenant.
    Tenant(TenantContext),
    /// Every registered tenant alias, optionally with the reserved ones.
    AllTenants { include_reserved: bool },
}

/// Per-kind, per-alias migration outcomes.
#[derive(Debug, Default)]
pub struct MigrationReport {
    outcomes: BTreeMap<String, BTreeMap<String, Result<()>>>,
}

impl MigrationReport {
    pub fn outcomes(&self) -> &BTreeMap<String, BTreeMap<String, Result<()>>> {
        &self.outcomes
    }

    /// Outcome for one alias of one kind.
    pub fn outcome(&self, kind: &str, alias: &str) -> Option<&Result<()>> {
        self.outcomes.get(kind).and_then(|aliases| aliases.get(alias))
    }

    pub fn succeeded(&self) -> usize {
        self.iter().filter(|(_, _, r)| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.iter().filter(|(_, _, r)| r.is_err()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &str, &Result<()>)> {
        self.outcomes.iter().flat_map(|(kind, aliases)| {
            aliases
                .iter()
                .map(move |(alias, outcome)| (kind.as_str(), alias.as_str(), outcome))
        })
    }
}

/// The registries of one service, keyed by resource kind.
pub struct ResourceManager {
    codec: Arc<AliasCodec>,
    registries: BTreeMap<String, Arc<ResourceRegistry>>,
}

impl ResourceManager {
    pub fn new(codec: Arc<AliasCodec>) -> Self {
        Self {
            codec,
            registries: BTreeMap::new(),
        }
    }

    /// Add the registry of one kind. Each kind may be added once.
    pub fn with_registry(mut self, registry: ResourceRegistry) -> Result<Self> {
        let kind = registry.kind().to_string();
        if self.registries.contains_key(&kind) {
            return Err(RouterError::Configuration(format!(
                "resource kind {} registered twice",
                kind
            )));
        }
        self.registries.insert(kind, Arc::new(registry));
        Ok(self)
    }

    pub fn codec(&self) -> &Arc<AliasCodec> {
        &self.codec
    }

    /// Registry for `kind`.
    pub fn registry(&self, kind: &str) -> Result<&Arc<ResourceRegistry>> {
        self.registries.get(kind).ok_or_else(|| {
            RouterError::Configuration(format!("no registry for resource kind {}", kind))
        })
    }

    pub fn registries(&self) -> impl Iterator<Item = &Arc<ResourceRegistry>> {
        self.registries.values()
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.registries.keys().map(String::as_str).collect()
    }

    /// Register every stored resource config of the given tenants.
    ///
    /// Returns how many aliases were registered.
    pub async fn bootstrap(&self, store: &dyn ConfigStore, tenants: &[TenantContext]) -> Result<usize> {
        let mut registered = 0;

        for tenant in tenants {
            for (kind, registry) in &self.registries {
                let pattern = format!("{}*", self.codec.kind_prefix(tenant.alias(), kind));
                for key in store.iter_keys(&pattern).await? {
                    let parts = self.codec.deconstruct(&key)?;
                    if &parts.resource_kind != kind || parts.tenant_alias != tenant.alias() {
                        debug!(key = %key, kind = %kind, "Skipping key of another kind or tenant");
                        continue;
                    }

                    let Some(raw) = store.get(&key).await? else {
                        continue;
                    };
                    let config = stored_config(registry, &raw)?;
                    registry.register(&key, &config)?;
                    registered += 1;
                }
            }
        }

        info!(
            tenants = tenants.len(),
            aliases = registered,
            "Resource registries bootstrapped"
        );
        Ok(registered)
    }

    /// Apply one lifecycle event to every registry it touches.
    pub async fn apply(&self, event: &LifecycleEvent) -> Result<()> {
        match event.lifecycle_event {
            LifecycleKind::OnTenantCreate => {
                for (kind, aliases) in &event.resources {
                    let registry = self.registry(kind)?;
                    for (alias, config) in aliases {
                        registry.register(alias, config)?;
                    }
                }
            }
            LifecycleKind::OnTenantUpdate => {
                for (kind, aliases) in &event.resources {
                    let registry = self.registry(kind)?;
                    for (alias, config) in aliases {
                        registry.update(alias, config).await?;
                    }
                }
            }
            LifecycleKind::OnTenantDelete => {
                let tenant = event.tenant();
                for (kind, registry) in &self.registries {
                    let mut aliases = registry.aliases_for_tenant(tenant.alias());
                    if let Some(listed) = event.resources.get(kind) {
                        aliases.extend(listed.keys().cloned());
                    }
                    aliases.sort();
                    aliases.dedup();

                    for alias in aliases {
                        registry.delete(&alias).await?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// `{kind → {alias → status}}` across every registry.
    pub async fn health_check(&self) -> BTreeMap<String, BTreeMap<String, HealthStatus>> {
        let mut report = BTreeMap::new();
        for (kind, registry) in &self.registries {
            report.insert(kind.clone(), registry.health_check().await);
        }
        report
    }

    /// Run migrations for `scope`. Failures are reported, not raised.
    pub async fn migrate(&self, scope: &MigrationScope) -> MigrationReport {
        let mut report = MigrationReport::default();

        for (kind, registry) in &self.registries {
            if !registry.has_migrator() {
                continue;
            }

            let aliases: Vec<String> = match scope {
                MigrationScope::Tenant(tenant) => registry.aliases_for_tenant(tenant.alias()),
                MigrationScope::AllTenants { include_reserved } => {
                    let mut aliases: Vec<String> = registry.conn_aliases().into_iter().collect();
                    if *include_reserved {
                        aliases.extend(registry.reserved_aliases().iter().cloned());
                    }
                    aliases
                }
            };

            let outcomes = registry.migrate(&aliases).await;
            if !outcomes.is_empty() {
                report.outcomes.insert(kind.clone(), outcomes);
            }
        }

        if !report.is_success() {
            warn!(
                succeeded = report.succeeded(),
                failed = report.failed(),
                "Migration finished with failures"
            );
        }
        report
    }

    /// Close every live connection of every registry.
    pub async fn close_all(&self) {
        for registry in self.registries.values() {
            registry.close_all().await;
        }
    }
}

fn stored_config(registry: &ResourceRegistry, raw: &Value) -> Result<ResourceConfig> {
    match raw {
        Value::Object(map) => Ok(map.clone()),
        other => registry.factory().format_config(other),
    }
}

#[async_trait]
impl LifecycleSubscriber for ResourceManager {
    fn name(&self) -> &str {
        "resource-manager"
    }

    async fn on_event(&self, event: &LifecycleEvent) -> Result<()> {
        self.apply(event).await
    }
}
