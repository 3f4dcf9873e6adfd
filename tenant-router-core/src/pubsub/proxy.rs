//! Channel → handler dispatch over a pluggable backend.

use super::{ChannelKind, MessageSink, NormalizedEvent, PubSubBackend, RawMessage};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Handles events delivered on a bound channel.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn handle(&self, event: NormalizedEvent) -> Result<()>;
}

/// Keeps channel bindings and routes inbound messages to their handler.
///
/// Pattern bindings are prefixes; an event on a pattern delivery goes to
/// the longest registered prefix of its channel name.
pub struct PubSubProxy {
    backend: Arc<dyn PubSubBackend>,
    exact: RwLock<HashMap<String, Arc<dyn ChannelHandler>>>,
    patterns: RwLock<BTreeMap<String, Arc<dyn ChannelHandler>>>,
}

impl PubSubProxy {
    pub fn new(backend: Arc<dyn PubSubBackend>) -> Self {
        Self {
            backend,
            exact: RwLock::new(HashMap::new()),
            patterns: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn PubSubBackend> {
        &self.backend
    }

    /// Bind handlers and subscribe their channels on the backend.
    pub async fn subscribe<I>(&self, handlers: I, kind: ChannelKind) -> Result<()>
    where
        I: IntoIterator<Item = (String, Arc<dyn ChannelHandler>)>,
    {
        let handlers: Vec<_> = handlers.into_iter().collect();
        if handlers.is_empty() {
            return Ok(());
        }
        let channels: Vec<String> = handlers.iter().map(|(c, _)| c.clone()).collect();

        // Bind before subscribing so no delivery finds an empty slot.
        {
            let mut bindings = match kind {
                ChannelKind::Exact => Bindings::Exact(self.exact.write()),
                ChannelKind::Pattern => Bindings::Pattern(self.patterns.write()),
            };
            for (channel, handler) in handlers {
                bindings.insert(channel, handler);
            }
        }

        if let Err(e) = self.backend.subscribe(&channels, kind).await {
            self.unbind(&channels);
            return Err(e);
        }

        info!(backend = %self.backend.name(), ?kind, channels = ?channels, "Subscribed to channels");
        Ok(())
    }

    /// Drop bindings and unsubscribe their channels on the backend.
    pub async fn unsubscribe(&self, channels: &[String]) -> Result<()> {
        if channels.is_empty() {
            return Ok(());
        }
        self.unbind(channels);
        self.backend.unsubscribe(channels).await?;
        info!(backend = %self.backend.name(), channels = ?channels, "Unsubscribed from channels");
        Ok(())
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let receivers = self.backend.publish(channel, payload).await?;
        debug!(channel = %channel, receivers, "Published message");
        Ok(receivers)
    }

    /// Handler bound to the event's channel.
    pub fn resolve(&self, event: &NormalizedEvent) -> Option<Arc<dyn ChannelHandler>> {
        if event.kind == ChannelKind::Exact
            && let Some(handler) = self.exact.read().get(&event.channel)
        {
            return Some(Arc::clone(handler));
        }

        self.patterns
            .read()
            .iter()
            .filter(|(prefix, _)| event.channel.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, handler)| Arc::clone(handler))
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.exact.read().contains_key(channel) || self.patterns.read().contains_key(channel)
    }

    /// Every bound channel and pattern, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.exact.read().keys().cloned().collect();
        channels.extend(self.patterns.read().keys().cloned());
        channels.sort();
        channels
    }

    /// Normalise and route one message.
    pub async fn dispatch(&self, raw: RawMessage) -> Result<()> {
        let event = self.backend.normalize(raw);
        let Some(handler) = self.resolve(&event) else {
            warn!(channel = %event.channel, kind = ?event.kind, "No handler bound for channel");
            return Ok(());
        };

        debug!(channel = %event.channel, "Dispatching event");
        handler.handle(event).await
    }

    /// Start the backend's listening loop with this proxy as its sink.
    pub async fn listen(self: &Arc<Self>) -> Result<()> {
        let sink: Arc<dyn MessageSink> = Arc::clone(self) as Arc<dyn MessageSink>;
        self.backend.start(sink).await
    }

    /// Stop the backend's listening loop.
    pub async fn shutdown(&self) -> Result<()> {
        self.backend.stop().await
    }

    fn unbind(&self, channels: &[String]) {
        let mut exact = self.exact.write();
        let mut patterns = self.patterns.write();
        for channel in channels {
            exact.remove(channel);
            patterns.remove(channel);
        }
    }
}

enum Bindings<'a> {
    Exact(parking_lot::RwLockWriteGuard<'a, HashMap<String, Arc<dyn ChannelHandler>>>),
    Pattern(parking_lot::RwLockWriteGuard<'a, BTreeMap<String, Arc<dyn ChannelHandler>>>),
}

impl Bindings<'_> {
    fn insert(&mut self, channel: String, handler: Arc<dyn ChannelHandler>) {
        match self {
            Self::Exact(map) => {
                map.insert(channel, handler);
            }
            Self::Pattern(map) => {
                map.insert(channel, handler);
            }
        }
    }
}

#[async_trait]
impl MessageSink for PubSubProxy {
    async fn deliver(&self, message: RawMessage) {
        let channel = message.channel.clone();
        if let Err(e) = self.dispatch(message).await {
            error!(channel = %channel, error = %e, "Channel handler failed");
        }
    }
}
