//! Composite key codec.
//!
//! Resource aliases, config-store keys and tenant-scoped channel names
//! share one layout:
//!
//! ```text
//! <tenant_alias>_<service_name>_<resource_kind>_<logical_name>
//! <tenant_alias>_<service_name>_<lifecycle_event>
//! ```
//!
//! Decoding pivots on the first `_<service_name>_` occurrence, then on the
//! longest declared resource kind followed by `_`. Because tenant aliases
//! and logical names may themselves contain `_`, [`AliasCodec::construct`]
//! decodes its own output and refuses any combination that would not
//! round-trip.

use crate::error::{DeconstructionError, Result, RouterError};
use crate::tenant::KEY_SEPARATOR;
use tracing::error;

const ALIAS_SCHEMA: &str = "<tenant_alias>_<service_name>_<resource_kind>_<logical_name>";
const TARGET_SCHEMA: &str = "<resource_kind>_<logical_name>";

/// Decoded parts of a resource alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AliasParts {
    pub tenant_alias: String,
    pub resource_kind: String,
    pub logical_name: String,
}

/// Encoder/decoder for the keys of one service.
#[derive(Debug, Clone)]
pub struct AliasCodec {
    service_name: String,
    pivot: String,
    // Longest first, so decoding picks the most specific kind.
    kinds: Vec<String>,
}

impl AliasCodec {
    /// Create a codec for `service_name` over the declared resource kinds.
    pub fn new<I, S>(service_name: impl Into<String>, kinds: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let service_name = service_name.into();
        if service_name.is_empty() || service_name.contains(KEY_SEPARATOR) {
            return Err(RouterError::Configuration(format!(
                "service name {:?} must be non-empty and must not contain '{}'",
                service_name, KEY_SEPARATOR
            )));
        }

        let mut kinds: Vec<String> = kinds.into_iter().map(Into::into).collect();
        if let Some(bad) = kinds.iter().find(|k| k.is_empty() || k.contains(KEY_SEPARATOR)) {
            return Err(RouterError::Configuration(format!(
                "resource kind {:?} must be non-empty and must not contain '{}'",
                bad, KEY_SEPARATOR
            )));
        }
        kinds.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        kinds.dedup();

        let pivot = format!("{sep}{service_name}{sep}", sep = KEY_SEPARATOR);
        Ok(Self {
            service_name,
            pivot,
            kinds,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Declared resource kinds, longest first.
    pub fn kinds(&self) -> &[String] {
        &self.kinds
    }

    pub fn declares(&self, kind: &str) -> bool {
        self.kinds.iter().any(|k| k == kind)
    }

    /// Join the parts into a resource alias.
    ///
    /// Fails when the result would decode to different parts.
    pub fn construct(&self, tenant_alias: &str, resource_kind: &str, logical_name: &str) -> Result<String> {
        let alias = format!(
            "{tenant}{pivot}{kind}{sep}{logical}",
            tenant = tenant_alias,
            pivot = self.pivot,
            kind = resource_kind,
            sep = KEY_SEPARATOR,
            logical = logical_name,
        );

        let expected = AliasParts {
            tenant_alias: tenant_alias.to_string(),
            resource_kind: resource_kind.to_string(),
            logical_name: logical_name.to_string(),
        };

        match self.decode(&alias) {
            Ok(parts) if parts == expected => Ok(alias),
            Ok(parts) => Err(self.fail(
                &alias,
                ALIAS_SCHEMA,
                format!(
                    "ambiguous components: would decode as ({}, {}, {})",
                    parts.tenant_alias, parts.resource_kind, parts.logical_name
                ),
            )),
            Err(reason) => Err(self.fail(&alias, ALIAS_SCHEMA, reason)),
        }
    }

    /// Split a resource alias into its parts.
    pub fn deconstruct(&self, alias: &str) -> std::result::Result<AliasParts, DeconstructionError> {
        self.decode(alias)
            .map_err(|reason| self.deconstruction_error("resource alias", alias, ALIAS_SCHEMA, reason))
    }

    /// Split a `<resource_kind>_<logical_name>` mapping target.
    pub fn parse_target(&self, target: &str) -> std::result::Result<(String, String), DeconstructionError> {
        self.split_kind(target)
            .map_err(|reason| self.deconstruction_error("mapping target", target, TARGET_SCHEMA, reason))
    }

    /// `<tenant_alias>_<service_name>_`: the prefix of every key owned by a tenant.
    pub fn tenant_prefix(&self, tenant_alias: &str) -> String {
        format!("{}{}", tenant_alias, self.pivot)
    }

    /// `<tenant_alias>_<service_name>_<resource_kind>_`
    pub fn kind_prefix(&self, tenant_alias: &str, resource_kind: &str) -> String {
        format!(
            "{}{}{}",
            self.tenant_prefix(tenant_alias),
            resource_kind,
            KEY_SEPARATOR
        )
    }

    /// Channel name for an event scoped to one tenant.
    pub fn channel(&self, tenant_alias: &str, event: &str) -> String {
        format!("{}{}", self.tenant_prefix(tenant_alias), event)
    }

    /// Config-store key of the deploy-info mapping document.
    pub fn mapping_metadata_key(&self) -> String {
        format!("{}{}mapping_metadata", self.service_name, KEY_SEPARATOR)
    }

    fn decode(&self, alias: &str) -> std::result::Result<AliasParts, String> {
        let (tenant_alias, rest) = alias
            .split_once(self.pivot.as_str())
            .ok_or_else(|| format!("service pivot {:?} not found", self.pivot))?;

        if tenant_alias.is_empty() {
            return Err("empty tenant alias".to_string());
        }

        let (resource_kind, logical_name) = self.split_kind(rest)?;

        Ok(AliasParts {
            tenant_alias: tenant_alias.to_string(),
            resource_kind,
            logical_name,
        })
    }

    fn split_kind(&self, rest: &str) -> std::result::Result<(String, String), String> {
        let (kind, logical) = self
            .kinds
            .iter()
            .find_map(|kind| {
                rest.strip_prefix(kind.as_str())
                    .and_then(|tail| tail.strip_prefix(KEY_SEPARATOR))
                    .map(|logical| (kind, logical))
            })
            .ok_or_else(|| {
                format!(
                    "no declared resource kind {:?} found in {:?}",
                    self.kinds, rest
                )
            })?;

        if logical.is_empty() {
            return Err("empty logical name".to_string());
        }

        Ok((kind.clone(), logical.to_string()))
    }

    fn deconstruction_error(
        &self,
        entity: &str,
        value: &str,
        schema: &str,
        reason: String,
    ) -> DeconstructionError {
        let err = DeconstructionError {
            entity: entity.to_string(),
            value: value.to_string(),
            schema: schema.replace("<service_name>", &self.service_name),
            reason,
        };
        error!(entity = %err.entity, value = %err.value, reason = %err.reason, "Key does not match schema");
        err
    }

    fn fail(&self, value: &str, schema: &str, reason: String) -> RouterError {
        self.deconstruction_error("resource alias", value, schema, reason)
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> AliasCodec {
        AliasCodec::new("svc", ["relational-db", "cache"]).unwrap()
    }

    #[test]
    fn test_construct_layout() {
        let alias = codec()
            .construct("acme_example_com", "relational-db", "main")
            .unwrap();
        assert_eq!(alias, "acme_example_com_svc_relational-db_main");
    }

    #[test]
    fn test_round_trip() {
        let codec = codec();
        let cases = [
            ("acme_example_com", "relational-db", "main"),
            ("globex", "cache", "sessions_v2"),
            ("_base_", "cache", "default"),
            ("a1", "relational-db", "read_replica"),
        ];

        for (tenant, kind, logical) in cases {
            let alias = codec.construct(tenant, kind, logical).unwrap();
            let parts = codec.deconstruct(&alias).unwrap();
            assert_eq!(parts.tenant_alias, tenant);
            assert_eq!(parts.resource_kind, kind);
            assert_eq!(parts.logical_name, logical);
        }
    }

    #[test]
    fn test_construct_rejects_ambiguous_tenant_alias() {
        let err = codec()
            .construct("evil_svc_tenant", "cache", "main")
            .unwrap_err();
        assert!(matches!(err, RouterError::Deconstruction(_)));
    }

    #[test]
    fn test_construct_rejects_unknown_kind_and_empty_parts() {
        let codec = codec();
        assert!(codec.construct("acme", "queue", "main").is_err());
        assert!(codec.construct("acme", "cache", "").is_err());
        assert!(codec.construct("", "cache", "main").is_err());
    }

    #[test]
    fn test_deconstruct_foreign_keys() {
        let codec = codec();

        let err = codec.deconstruct("tenant_ids").unwrap_err();
        assert_eq!(err.entity, "resource alias");
        assert_eq!(err.value, "tenant_ids");
        assert!(err.schema.contains("svc"));

        assert!(codec.deconstruct("acme_svc_queue_main").is_err());
        assert!(codec.deconstruct("acme_other_cache_main").is_err());
    }

    #[test]
    fn test_longest_kind_wins() {
        let codec = AliasCodec::new("svc", ["db", "db-ro"]).unwrap();
        let parts = codec.deconstruct("acme_svc_db-ro_main").unwrap();
        assert_eq!(parts.resource_kind, "db-ro");
        assert_eq!(parts.logical_name, "main");
    }

    #[test]
    fn test_invalid_codec_settings() {
        assert!(AliasCodec::new("my_svc", ["cache"]).is_err());
        assert!(AliasCodec::new("", ["cache"]).is_err());
        assert!(AliasCodec::new("svc", ["bad_kind"]).is_err());
    }

    #[test]
    fn test_parse_target() {
        let codec = codec();
        assert_eq!(
            codec.parse_target("relational-db_main").unwrap(),
            ("relational-db".to_string(), "main".to_string())
        );
        assert!(codec.parse_target("unknown_main").is_err());
    }

    #[test]
    fn test_prefixes_and_channels() {
        let codec = codec();
        assert_eq!(codec.tenant_prefix("acme"), "acme_svc_");
        assert_eq!(codec.kind_prefix("acme", "cache"), "acme_svc_cache_");
        assert_eq!(
            codec.channel("acme_example_com", "on_tenant_delete"),
            "acme_example_com_svc_on_tenant_delete"
        );
        assert_eq!(codec.mapping_metadata_key(), "svc_mapping_metadata");
    }
}
