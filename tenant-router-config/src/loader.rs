//! Settings file loaders.
//!
//! Every format is normalised into a `serde_json::Value` tree so the
//! layers can be merged regardless of where they came from.

use crate::{ConfigError, Result};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

/// Supported settings file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Toml,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(FileFormat::Json),
            "toml" => Some(FileFormat::Toml),
            _ => None,
        }
    }

    /// Detect the format of `path` from its extension.
    pub fn detect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ConfigError::UnsupportedFormat(path.display().to_string()))?;

        Self::from_extension(ext).ok_or_else(|| ConfigError::UnsupportedFormat(ext.to_string()))
    }
}

/// Settings file loader.
pub struct ConfigLoader {
    format: FileFormat,
}

impl ConfigLoader {
    pub fn new(format: FileFormat) -> Self {
        Self { format }
    }

    /// Build a loader for whatever format `path` carries.
    pub fn auto(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(FileFormat::detect(path)?))
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    /// Read and parse a settings file. The root must be a table/object.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Map<String, Value>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::LoadError {
            source_name: path.display().to_string(),
            reason: e.to_string(),
        })?;

        self.parse(&content)
    }

    /// Parse settings from a string.
    pub fn parse(&self, content: &str) -> Result<Map<String, Value>> {
        let value = match self.format {
            FileFormat::Json => serde_json::from_str::<Value>(content).map_err(|e| {
                ConfigError::ParseError {
                    format: self.format,
                    reason: e.to_string(),
                }
            })?,
            FileFormat::Toml => {
                let table: toml::Table =
                    toml::from_str(content).map_err(|e| ConfigError::ParseError {
                        format: self.format,
                        reason: e.to_string(),
                    })?;
                serde_json::to_value(table).map_err(|e| ConfigError::ParseError {
                    format: self.format,
                    reason: e.to_string(),
                })?
            }
        };

        match value {
            Value::Object(map) => Ok(map),
            other => Err(ConfigError::ParseError {
                format: self.format,
                reason: format!("expected a table at the root, found {}", type_name(&other)),
            }),
        }
    }
}

/// Recursively merge `overlay` into `base`. Nested objects merge key by
/// key; any other value in `overlay` replaces the one in `base`.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_json() {
        let loader = ConfigLoader::new(FileFormat::Json);
        let map = loader
            .parse(r#"{"service_name": "svc", "queue_capacity": 50}"#)
            .unwrap();

        assert_eq!(map["service_name"], json!("svc"));
        assert_eq!(map["queue_capacity"], json!(50));
    }

    #[test]
    fn test_parse_toml_nested_tables() {
        let loader = ConfigLoader::new(FileFormat::Toml);
        let toml = r#"
            service_name = "svc"

            [resources.cache.templates.main]
            url = "redis://localhost:6379/0"
        "#;

        let map = loader.parse(toml).unwrap();
        assert_eq!(
            map["resources"]["cache"]["templates"]["main"]["url"],
            json!("redis://localhost:6379/0")
        );
    }

    #[test]
    fn test_parse_rejects_non_table_root() {
        let loader = ConfigLoader::new(FileFormat::Json);
        let err = loader.parse("[1, 2, 3]").unwrap_err();

        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(FileFormat::from_extension("json"), Some(FileFormat::Json));
        assert_eq!(FileFormat::from_extension("TOML"), Some(FileFormat::Toml));
        assert_eq!(FileFormat::from_extension("yaml"), None);
        assert!(FileFormat::detect("settings").is_err());
        assert_eq!(FileFormat::detect("conf/router.toml").unwrap(), FileFormat::Toml);
    }

    #[test]
    fn test_deep_merge_overrides_leaves_only() {
        let mut base = json!({
            "pubsub": {"backend": "memory", "read_burst": 5},
            "service_name": "svc"
        })
        .as_object()
        .cloned()
        .unwrap();
        let overlay = json!({"pubsub": {"backend": "redis"}})
            .as_object()
            .cloned()
            .unwrap();

        deep_merge(&mut base, overlay);

        assert_eq!(base["pubsub"]["backend"], json!("redis"));
        assert_eq!(base["pubsub"]["read_burst"], json!(5));
        assert_eq!(base["service_name"], json!("svc"));
    }
}
