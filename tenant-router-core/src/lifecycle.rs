//! Tenant lifecycle events.
//!
//! Every create/update/delete is published as a [`LifecycleEvent`]. The
//! `on_` tag travels over the wire; the paired `post_` tag names the
//! follow-up subscribers that run, locally, right after the `on_` ones.

use crate::alias::AliasCodec;
use crate::error::{Result, RouterError};
use crate::resource::ResourceConfig;
use crate::tenant::TenantContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Lifecycle event tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    OnTenantCreate,
    PostTenantCreate,
    OnTenantUpdate,
    PostTenantUpdate,
    OnTenantDelete,
    PostTenantDelete,
}

impl LifecycleKind {
    pub const ALL: [LifecycleKind; 6] = [
        Self::OnTenantCreate,
        Self::PostTenantCreate,
        Self::OnTenantUpdate,
        Self::PostTenantUpdate,
        Self::OnTenantDelete,
        Self::PostTenantDelete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnTenantCreate => "on_tenant_create",
            Self::PostTenantCreate => "post_tenant_create",
            Self::OnTenantUpdate => "on_tenant_update",
            Self::PostTenantUpdate => "post_tenant_update",
            Self::OnTenantDelete => "on_tenant_delete",
            Self::PostTenantDelete => "post_tenant_delete",
        }
    }

    pub fn is_post(&self) -> bool {
        matches!(
            self,
            Self::PostTenantCreate | Self::PostTenantUpdate | Self::PostTenantDelete
        )
    }

    /// The `post_` tag paired with this one.
    pub fn post(&self) -> Self {
        match self {
            Self::OnTenantCreate | Self::PostTenantCreate => Self::PostTenantCreate,
            Self::OnTenantUpdate | Self::PostTenantUpdate => Self::PostTenantUpdate,
            Self::OnTenantDelete | Self::PostTenantDelete => Self::PostTenantDelete,
        }
    }

    /// Update and delete travel on per-tenant channels; create is global.
    pub fn is_tenant_bound(&self) -> bool {
        !matches!(self, Self::OnTenantCreate | Self::PostTenantCreate)
    }

    /// Channel carrying this event for `tenant`.
    pub fn channel(&self, codec: &AliasCodec, tenant: &TenantContext) -> String {
        if self.is_tenant_bound() {
            codec.channel(tenant.alias(), self.as_str())
        } else {
            self.as_str().to_string()
        }
    }
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleKind {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| RouterError::InvalidPayload(format!("unknown lifecycle event {:?}", s)))
    }
}

/// Identity of one router process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(Uuid);

impl ProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// resource kind → alias → config
pub type ResourceChanges = BTreeMap<String, BTreeMap<String, ResourceConfig>>;

/// Wire payload of a lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub tenant_id: String,
    pub lifecycle_event: LifecycleKind,
    #[serde(default)]
    pub resources: ResourceChanges,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_uuid: Option<ProcessId>,
    #[serde(default = "Utc::now")]
    pub emitted_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(tenant_id: impl Into<String>, kind: LifecycleKind) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            lifecycle_event: kind,
            resources: ResourceChanges::new(),
            proc_uuid: None,
            emitted_at: Utc::now(),
        }
    }

    /// Add one resource change.
    pub fn with_resource(
        mut self,
        kind: impl Into<String>,
        alias: impl Into<String>,
        config: ResourceConfig,
    ) -> Self {
        self.resources
            .entry(kind.into())
            .or_default()
            .insert(alias.into(), config);
        self
    }

    /// Stamp the originating process.
    pub fn with_origin(mut self, process: ProcessId) -> Self {
        self.proc_uuid = Some(process);
        self
    }

    /// The tenant this event is about.
    pub fn tenant(&self) -> TenantContext {
        TenantContext::new(self.tenant_id.clone())
    }

    /// Channel this event is published on.
    pub fn channel(&self, codec: &AliasCodec) -> String {
        self.lifecycle_event.channel(codec, &self.tenant())
    }

    pub fn is_from(&self, process: ProcessId) -> bool {
        self.proc_uuid == Some(process)
    }

    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| RouterError::InvalidPayload(format!("not a lifecycle event: {}", e)))
    }
}

/// Reacts to lifecycle events.
#[async_trait]
pub trait LifecycleSubscriber: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn on_event(&self, event: &LifecycleEvent) -> Result<()>;
}

/// Skips events that originated in this process.
///
/// The originating process applies its own mutation synchronously before
/// publishing, so applying it again from the bus would be redundant.
pub struct ProcessFilter {
    inner: Arc<dyn LifecycleSubscriber>,
    process: ProcessId,
    name: String,
}

impl ProcessFilter {
    pub fn new(inner: Arc<dyn LifecycleSubscriber>, process: ProcessId) -> Self {
        let name = format!("{}[process-filtered]", inner.name());
        Self {
            inner,
            process,
            name,
        }
    }
}

#[async_trait]
impl LifecycleSubscriber for ProcessFilter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_event(&self, event: &LifecycleEvent) -> Result<()> {
        if event.is_from(self.process) {
            debug!(
                subscriber = %self.inner.name(),
                tenant_id = %event.tenant_id,
                event = %event.lifecycle_event,
                "Skipping self-originated event"
            );
            return Ok(());
        }
        self.inner.on_event(event).await
    }
}
