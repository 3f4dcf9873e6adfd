//! Config store seeding.
//!
//! Loads the mapping metadata and, optionally, tenant deploy info into a
//! config store. Seeding writes store state only and publishes nothing;
//! running processes see it after their next bootstrap.

use crate::admin::{plan_resources, MappingMetadata};
use crate::error::{Result, RouterError};
use crate::manager::ResourceManager;
use crate::store::{ConfigStore, TENANT_IDS_KEY};
use crate::tenant::TenantContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tenant_router_config::ConfigLoader;
use tracing::info;

/// A seed document.
///
/// ```toml
/// [mapping_metadata]
/// db_url = "relational-db_main"
///
/// [tenants."acme.example.com"]
/// db_url = "postgres://db.acme/acme"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedDocument {
    #[serde(default)]
    pub mapping_metadata: MappingMetadata,
    /// tenant id → deploy info
    #[serde(default)]
    pub tenants: BTreeMap<String, BTreeMap<String, Value>>,
}

impl SeedDocument {
    /// Read a JSON or TOML seed file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let layer = ConfigLoader::auto(path)?.load_file(path)?;
        Ok(serde_json::from_value(Value::Object(layer))?)
    }
}

/// Seeding switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedOptions {
    /// Clear the whole store first.
    pub flush_all: bool,
    /// Provision the document's tenants, not only the mapping.
    pub include_tenant_metadata: bool,
}

/// What a seed run wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub mapping_keys: usize,
    pub tenants: Vec<String>,
    pub aliases: Vec<String>,
}

pub struct ConfigSeeder {
    store: Arc<dyn ConfigStore>,
    resources: Arc<ResourceManager>,
}

impl ConfigSeeder {
    pub fn new(store: Arc<dyn ConfigStore>, resources: Arc<ResourceManager>) -> Self {
        Self { store, resources }
    }

    pub async fn seed(&self, document: &SeedDocument, options: SeedOptions) -> Result<SeedReport> {
        // Validate the whole document before touching the store.
        let mut plans = Vec::new();
        if options.include_tenant_metadata {
            for (tenant_id, deploy_info) in &document.tenants {
                let tenant = TenantContext::new(tenant_id.as_str());
                if tenant.is_empty() || tenant.is_base() {
                    return Err(RouterError::InvalidContext(format!(
                        "{:?} cannot be seeded as a tenant",
                        tenant_id
                    )));
                }
                let plan = plan_resources(
                    &self.resources,
                    &document.mapping_metadata,
                    &tenant,
                    deploy_info,
                )?;
                plans.push((tenant_id.clone(), plan));
            }
        }

        if options.flush_all {
            self.store.clear().await?;
            info!("Config store flushed");
        }

        let mapping_key = self.resources.codec().mapping_metadata_key();
        self.store
            .set_typed(&mapping_key, &document.mapping_metadata)
            .await?;

        let mut report = SeedReport {
            mapping_keys: document.mapping_metadata.len(),
            ..SeedReport::default()
        };
        if plans.is_empty() {
            info!(mapping_keys = report.mapping_keys, "Mapping metadata seeded");
            return Ok(report);
        }

        let mut ids: Vec<String> = self
            .store
            .get_typed(TENANT_IDS_KEY)
            .await?
            .unwrap_or_default();
        for (tenant_id, plan) in plans {
            for resource in plan {
                self.store
                    .set(&resource.alias, Value::Object(resource.config))
                    .await?;
                report.aliases.push(resource.alias);
            }
            if !ids.contains(&tenant_id) {
                ids.push(tenant_id.clone());
            }
            report.tenants.push(tenant_id);
        }
        self.store.set_typed(TENANT_IDS_KEY, &ids).await?;

        info!(
            mapping_keys = report.mapping_keys,
            tenants = report.tenants.len(),
            aliases = report.aliases.len(),
            "Config store seeded"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::AliasCodec;
    use crate::resource::{Connection, ConnectionFactory, ResourceConfig, ResourceRegistry};
    use crate::store::InMemoryConfigStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct NoConnect;

    #[async_trait]
    impl ConnectionFactory for NoConnect {
        async fn connect(&self, alias: &str, _config: &ResourceConfig) -> Result<Arc<dyn Connection>> {
            Err(RouterError::connection(alias, "not in tests"))
        }
    }

    fn seeder(store: Arc<InMemoryConfigStore>) -> ConfigSeeder {
        let codec = Arc::new(AliasCodec::new("svc", ["relational-db"]).unwrap());
        let registry = ResourceRegistry::builder("relational-db", Arc::clone(&codec))
            .with_template("main", ResourceConfig::new())
            .with_factory(Arc::new(NoConnect))
            .build()
            .unwrap();
        let resources = ResourceManager::new(codec).with_registry(registry).unwrap();
        ConfigSeeder::new(store, Arc::new(resources))
    }

    fn document() -> SeedDocument {
        serde_json::from_value(json!({
            "mapping_metadata": {"db_url": "relational-db_main"},
            "tenants": {
                "acme.example.com": {"db_url": "postgres://db.acme/acme"},
                "globex": {"db_url": {"host": "db.globex"}}
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_mapping_only_by_default() {
        let store = Arc::new(InMemoryConfigStore::new());
        let report = seeder(Arc::clone(&store))
            .seed(&document(), SeedOptions::default())
            .await
            .unwrap();

        assert_eq!(report.mapping_keys, 1);
        assert!(report.tenants.is_empty());
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("svc_mapping_metadata").await.unwrap(),
            Some(json!({"db_url": "relational-db_main"}))
        );
    }

    #[tokio::test]
    async fn test_tenant_metadata_and_flush() {
        let store = Arc::new(InMemoryConfigStore::new());
        store.set("stale", json!(1)).await.unwrap();

        let options = SeedOptions {
            flush_all: true,
            include_tenant_metadata: true,
        };
        let report = seeder(Arc::clone(&store))
            .seed(&document(), options)
            .await
            .unwrap();

        assert_eq!(report.tenants, vec!["acme.example.com", "globex"]);
        assert!(store.get("stale").await.unwrap().is_none());
        assert_eq!(
            store.get("tenant_ids").await.unwrap(),
            Some(json!(["acme.example.com", "globex"]))
        );
        let acme = store
            .get("acme_example_com_svc_relational-db_main")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acme["host"], "db.acme");
        let globex = store.get("globex_svc_relational-db_main").await.unwrap().unwrap();
        assert_eq!(globex, json!({"host": "db.globex"}));
    }

    #[tokio::test]
    async fn test_invalid_document_writes_nothing() {
        let store = Arc::new(InMemoryConfigStore::new());
        let mut document = document();
        document
            .tenants
            .entry("initech".to_string())
            .or_default()
            .insert("cache_url".to_string(), json!("redis://cache"));

        let options = SeedOptions {
            flush_all: false,
            include_tenant_metadata: true,
        };
        let result = seeder(Arc::clone(&store)).seed(&document, options).await;

        assert!(matches!(result, Err(RouterError::Configuration(_))));
        assert!(store.is_empty());
    }
}
