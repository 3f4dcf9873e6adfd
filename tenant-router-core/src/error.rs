//! Error taxonomy for tenant routing.

use tenant_router_config::ConfigError;

/// A composite key that does not decode under this service's key schema.
///
/// Either the key is malformed or it belongs to another system. Callers
/// should never swallow it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cannot deconstruct {entity} {value:?} with schema {schema}: {reason}")]
pub struct DeconstructionError {
    /// What kind of key was being decoded (e.g. "resource alias").
    pub entity: String,
    /// The offending value.
    pub value: String,
    /// Human-readable layout the value was expected to follow.
    pub schema: String,
    /// Which pivot could not be located.
    pub reason: String,
}

/// Tenant routing errors
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Deconstruction(#[from] DeconstructionError),

    #[error("Unknown alias: {0}")]
    UnknownAlias(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Reserved alias cannot be tenant-provisioned: {0}")]
    ReservedAliasViolation(String),

    #[error("Unable to resolve tenant id: {0}")]
    TenantIdResolve(String),

    #[error("Invalid tenant context: {0}")]
    InvalidContext(String),

    #[error("Context stack cannot pop its base context")]
    EmptyStack,

    #[error("No tenant context scope is active on this task")]
    NoActiveScope,

    #[error("No template named {logical_name:?} for resource kind {kind}")]
    UnknownTemplate { kind: String, logical_name: String },

    #[error("Alias {alias} belongs to resource kind {found}, not {expected}")]
    KindMismatch {
        alias: String,
        expected: String,
        found: String,
    },

    #[error("Config store error: {0}")]
    Store(String),

    #[error("Pub/Sub error: {0}")]
    PubSub(String),

    #[error("Connection error for {alias}: {message}")]
    Connection { alias: String, message: String },

    #[error("Migration failed for {alias}: {message}")]
    Migration { alias: String, message: String },

    #[error("Deferred work panicked: {0}")]
    Panicked(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RouterError {
    /// Lookup misses that callers may treat as propagation lag.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::UnknownAlias(_) | Self::TenantNotFound(_))
    }

    pub(crate) fn connection(alias: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            alias: alias.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
