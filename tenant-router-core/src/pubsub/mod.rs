//! Publish/subscribe plumbing.
//!
//! A [`PubSubBackend`] is the pluggable transport. It owns one listening
//! loop per process and hands every received message to a
//! [`MessageSink`]. The [`PubSubProxy`] is that sink: it keeps the
//! channel → handler bindings and dispatches normalised events.

pub mod memory;
pub mod proxy;

pub use memory::{MemoryBroker, MemoryPubSub};
pub use proxy::{ChannelHandler, PubSubProxy};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// How a subscription matches channel names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// The channel name must match exactly.
    Exact,
    /// The subscription key is a prefix of the channel name.
    Pattern,
}

/// A message as the transport delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Concrete channel the message was published on.
    pub channel: String,
    /// Subscription pattern that matched, for pattern deliveries.
    pub pattern: Option<String>,
    pub payload: String,
}

/// A message in transport-neutral form.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub channel: String,
    pub kind: ChannelKind,
    /// Parsed JSON payload, or the raw text as a JSON string.
    pub data: Value,
}

/// Receives messages from a backend's listening loop.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, message: RawMessage);
}

/// Pluggable publish/subscribe transport.
#[async_trait]
pub trait PubSubBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Start receiving messages for `channels`.
    async fn subscribe(&self, channels: &[String], kind: ChannelKind) -> Result<()>;

    /// Stop receiving messages for `channels`, whatever their kind.
    async fn unsubscribe(&self, channels: &[String]) -> Result<()>;

    /// Publish `payload`, returning how many receivers the transport reported.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Translate a transport message into a [`NormalizedEvent`].
    fn normalize(&self, raw: RawMessage) -> NormalizedEvent {
        let kind = if raw.pattern.is_some() {
            ChannelKind::Pattern
        } else {
            ChannelKind::Exact
        };
        let data = serde_json::from_str(&raw.payload).unwrap_or(Value::String(raw.payload));

        NormalizedEvent {
            channel: raw.channel,
            kind,
            data,
        }
    }

    /// Spawn the listening loop, delivering into `sink`.
    async fn start(&self, sink: Arc<dyn MessageSink>) -> Result<()>;

    /// Stop the listening loop and wait for it to exit.
    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}
