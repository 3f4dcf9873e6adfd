//! Environment variable layer.
//!
//! Variables are matched on a prefix, the prefix is stripped, and the
//! remainder is split on `__` into a nested key path:
//! `TENANT_ROUTER_PUBSUB__READ_BURST=8` becomes `pubsub.read_burst = 8`.
//!
//! Values are coerced to booleans, integers or JSON unless their key path
//! was declared a string key.

use crate::{ConfigError, Result};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::env;

const NESTING_SEPARATOR: &str = "__";

/// Environment variable loader
pub struct EnvLoader {
    prefix: Option<String>,
    string_keys: BTreeSet<String>,
}

impl EnvLoader {
    /// Create a new environment loader
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            prefix,
            string_keys: BTreeSet::new(),
        }
    }

    /// Dotted key paths (`pubsub.url`) whose values are never coerced.
    pub fn with_string_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.string_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Collect matching variables as flat, lowercased keys with the prefix removed.
    pub fn load(&self) -> HashMap<String, String> {
        self.collect(env::vars())
    }

    /// Collect matching variables as a nested tree with coerced values.
    pub fn load_nested(&self) -> Map<String, Value> {
        nest(self.load(), &self.string_keys)
    }

    fn collect(&self, vars: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
        let prefix = self.prefix.as_ref().map(|prefix| format!("{}_", prefix));
        vars.filter_map(|(key, value)| match &prefix {
            Some(prefix) => key
                .strip_prefix(prefix.as_str())
                .map(|rest| (rest.to_lowercase(), value)),
            None => Some((key.to_lowercase(), value)),
        })
        .filter(|(key, _)| !key.is_empty())
        .collect()
    }

    /// Load a specific environment variable
    pub fn load_var(&self, key: &str) -> Result<String> {
        let full_key = match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix, key.to_uppercase()),
            None => key.to_uppercase(),
        };

        env::var(&full_key).map_err(ConfigError::EnvError)
    }

    /// Load with default value
    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Interpret a raw environment string as the JSON value it most likely means.
pub fn coerce(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }

    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::from(n);
    }

    if (trimmed.starts_with('[') || trimmed.starts_with('{'))
        && let Ok(value) = serde_json::from_str::<Value>(trimmed)
    {
        return value;
    }

    Value::String(raw.to_string())
}

fn nest(flat: HashMap<String, String>, string_keys: &BTreeSet<String>) -> Map<String, Value> {
    let mut root = Map::new();

    // Shorter paths first so a deeper key can replace a scalar parent.
    let mut entries: Vec<_> = flat.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    'entries: for (key, raw) in entries {
        let value = if string_keys.contains(&key.replace(NESTING_SEPARATOR, ".")) {
            Value::String(raw)
        } else {
            coerce(&raw)
        };

        let mut segments: Vec<&str> = key.split(NESTING_SEPARATOR).collect();
        let Some(leaf) = segments.pop() else {
            continue;
        };

        let mut cursor = &mut root;
        for segment in segments {
            let slot = cursor
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            let Value::Object(next) = slot else {
                continue 'entries;
            };
            cursor = next;
        }
        cursor.insert(leaf.to_string(), value);
    }

    root
}
