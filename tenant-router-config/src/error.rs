//! Errors raised while assembling settings layers.

use thiserror::Error;

use crate::loader::FileFormat;

/// Settings loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A dotted key has no value in any layer.
    #[error("Configuration key not found: {0}")]
    KeyNotFound(String),

    /// A layer could not be read.
    #[error("Failed to load {source_name}: {reason}")]
    LoadError { source_name: String, reason: String },

    /// A layer was read but its content is not valid for its format.
    #[error("Failed to parse {format:?} configuration: {reason}")]
    ParseError { format: FileFormat, reason: String },

    /// A file extension with no matching loader.
    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    /// The merged settings violate a rule.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The merged settings do not fit the requested type.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Environment variable error: {0}")]
    EnvError(#[from] std::env::VarError),
}

impl ConfigError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
