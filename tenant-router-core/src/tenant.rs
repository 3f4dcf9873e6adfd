//! Tenant Identity
//!
//! [`TenantContext`] is the value every unit of work is bound to, and
//! [`TenantRegistry`] is this process's view of which tenants exist.

use crate::error::{Result, RouterError};
use crate::lifecycle::{LifecycleEvent, LifecycleKind, LifecycleSubscriber};
use crate::store::{ConfigStore, TENANT_IDS_KEY};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

/// Identifier of the system tenant every context stack starts from.
pub const BASE_TENANT_ID: &str = "__base__";

/// Canonical separator used in aliases and composite keys.
pub const KEY_SEPARATOR: char = '_';

/// Tenant identity: the opaque id and its normalised alias.
///
/// The alias is derived from the id by collapsing every run of
/// non-alphanumeric characters into a single [`KEY_SEPARATOR`].
///
/// # Examples
///
/// ```
/// use tenant_router_core::TenantContext;
///
/// let tenant = TenantContext::new("acme.example.com");
/// assert_eq!(tenant.alias(), "acme_example_com");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    id: String,
    alias: String,
}

impl TenantContext {
    /// Create a context for `id`.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let alias = normalize_alias(&id);
        Self { id, alias }
    }

    /// The system context seeded at the bottom of every stack.
    pub fn base() -> Self {
        Self::new(BASE_TENANT_ID)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn is_base(&self) -> bool {
        self.id == BASE_TENANT_ID
    }

    /// A context is usable only when both parts are non-empty.
    pub fn is_empty(&self) -> bool {
        self.id.is_empty() || self.alias.is_empty()
    }
}

impl fmt::Display for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.alias)
    }
}

/// Normalise a tenant id into an alias.
pub fn normalize_alias(id: &str) -> String {
    let mut alias = String::with_capacity(id.len());
    let mut in_separator_run = false;

    for c in id.chars() {
        if c.is_alphanumeric() {
            alias.push(c);
            in_separator_run = false;
        } else if !in_separator_run {
            alias.push(KEY_SEPARATOR);
            in_separator_run = true;
        }
    }

    alias
}

/// In-process registry of known tenants.
///
/// Loaded once at startup from the config store and then mutated only
/// through lifecycle events applied at drain points.
#[derive(Default)]
pub struct TenantRegistry {
    tenants: RwLock<HashMap<String, TenantContext>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a fixed list of ids.
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tenants = ids
            .into_iter()
            .map(|id| {
                let tenant = TenantContext::new(id);
                (tenant.id().to_string(), tenant)
            })
            .collect();

        Self {
            tenants: RwLock::new(tenants),
        }
    }

    /// Replace the registry contents with the tenant id list held in `store`.
    pub async fn load(&self, store: &dyn ConfigStore) -> Result<usize> {
        let ids: Vec<String> = store.get_typed(TENANT_IDS_KEY).await?.unwrap_or_default();

        let loaded: HashMap<_, _> = ids
            .into_iter()
            .map(|id| {
                let tenant = TenantContext::new(id);
                (tenant.id().to_string(), tenant)
            })
            .collect();
        let count = loaded.len();

        *self.tenants.write() = loaded;
        info!(tenants = count, "Tenant registry loaded");

        Ok(count)
    }

    /// Look a tenant up by id.
    pub fn get_by_id(&self, id: &str) -> Result<TenantContext> {
        self.tenants
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RouterError::TenantNotFound(id.to_string()))
    }

    /// Look a tenant up by alias.
    pub fn get_by_alias(&self, alias: &str) -> Result<TenantContext> {
        self.tenants
            .read()
            .values()
            .find(|tenant| tenant.alias() == alias)
            .cloned()
            .ok_or_else(|| RouterError::TenantNotFound(alias.to_string()))
    }

    /// Look a tenant up by id, falling back to alias.
    pub fn resolve(&self, identifier: &str) -> Result<TenantContext> {
        self.get_by_id(identifier)
            .or_else(|_| self.get_by_alias(identifier))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tenants.read().contains_key(id)
    }

    /// All known tenants, ordered by id.
    pub fn all(&self) -> Vec<TenantContext> {
        let mut tenants: Vec<_> = self.tenants.read().values().cloned().collect();
        tenants.sort_by(|a, b| a.id().cmp(b.id()));
        tenants
    }

    pub fn ids(&self) -> Vec<String> {
        self.all().into_iter().map(|t| t.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.tenants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.read().is_empty()
    }

    /// Register the tenant named by a create event, replacing any earlier context.
    pub fn on_create(&self, event: &LifecycleEvent) -> TenantContext {
        let tenant = event.tenant();
        self.tenants
            .write()
            .insert(tenant.id().to_string(), tenant.clone());
        debug!(tenant_id = %tenant.id(), "Tenant added to registry");
        tenant
    }

    /// Forget the tenant named by a delete event.
    pub fn on_delete(&self, event: &LifecycleEvent) -> Option<TenantContext> {
        let removed = self.tenants.write().remove(&event.tenant_id);
        if removed.is_some() {
            debug!(tenant_id = %event.tenant_id, "Tenant removed from registry");
        }
        removed
    }
}

#[async_trait]
impl LifecycleSubscriber for TenantRegistry {
    fn name(&self) -> &str {
        "tenant-registry"
    }

    async fn on_event(&self, event: &LifecycleEvent) -> Result<()> {
        match event.lifecycle_event {
            LifecycleKind::OnTenantCreate => {
                self.on_create(event);
            }
            LifecycleKind::OnTenantDelete => {
                self.on_delete(event);
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryConfigStore;
    use serde_json::json;

    #[test]
    fn test_alias_normalization() {
        assert_eq!(TenantContext::new("acme.example.com").alias(), "acme_example_com");
        assert_eq!(TenantContext::new("globex-corp").alias(), "globex_corp");
        assert_eq!(TenantContext::new("a..b--c").alias(), "a_b_c");
        assert_eq!(TenantContext::new("plain").alias(), "plain");
    }

    #[test]
    fn test_context_is_derived_from_id() {
        let a = TenantContext::new("acme.example.com");
        let b = TenantContext::new("acme.example.com");
        assert_eq!(a, b);
        assert!(!a.is_empty());
        assert!(TenantContext::new("").is_empty());
        assert!(TenantContext::base().is_base());
    }

    #[tokio::test]
    async fn test_load_from_store() {
        let store = InMemoryConfigStore::new();
        store
            .set(TENANT_IDS_KEY, json!(["acme.example.com", "globex.example.com"]))
            .await
            .unwrap();

        let registry = TenantRegistry::new();
        let count = registry.load(&store).await.unwrap();

        assert_eq!(count, 2);
        assert!(registry.contains("acme.example.com"));
        assert_eq!(
            registry.get_by_alias("globex_example_com").unwrap().id(),
            "globex.example.com"
        );
    }

    #[tokio::test]
    async fn test_load_with_no_tenant_list() {
        let store = InMemoryConfigStore::new();
        let registry = TenantRegistry::from_ids(["stale.example.com"]);

        assert_eq!(registry.load(&store).await.unwrap(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_misses() {
        let registry = TenantRegistry::from_ids(["acme.example.com"]);

        let err = registry.get_by_id("missing.example.com").unwrap_err();
        assert!(matches!(err, RouterError::TenantNotFound(_)));
        assert!(err.is_not_found());
        assert!(registry.get_by_alias("missing").is_err());
    }

    #[test]
    fn test_resolve_by_id_then_alias() {
        let registry = TenantRegistry::from_ids(["acme.example.com"]);

        assert_eq!(registry.resolve("acme.example.com").unwrap().alias(), "acme_example_com");
        assert_eq!(registry.resolve("acme_example_com").unwrap().id(), "acme.example.com");
    }

    #[tokio::test]
    async fn test_lifecycle_subscriber() {
        let registry = TenantRegistry::new();

        let create = LifecycleEvent::new("acme.example.com", LifecycleKind::OnTenantCreate);
        registry.on_event(&create).await.unwrap();
        assert_eq!(registry.ids(), vec!["acme.example.com".to_string()]);

        let update = LifecycleEvent::new("acme.example.com", LifecycleKind::OnTenantUpdate);
        registry.on_event(&update).await.unwrap();
        assert_eq!(registry.len(), 1);

        let delete = LifecycleEvent::new("acme.example.com", LifecycleKind::OnTenantDelete);
        registry.on_event(&delete).await.unwrap();
        assert!(registry.is_empty());
    }
}
