//! In-process transport.
//!
//! A [`MemoryBroker`] is a broadcast bus shared by every [`MemoryPubSub`]
//! created from it, so several routers in one binary behave like separate
//! processes talking through a real broker. Delivery semantics follow
//! Redis: a message matching both an exact and a pattern subscription is
//! delivered once per match.

use super::{ChannelKind, MessageSink, PubSubBackend, RawMessage};
use crate::error::{Result, RouterError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_BROKER_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Published {
    channel: String,
    payload: String,
}

/// Shared in-memory bus.
#[derive(Clone)]
pub struct MemoryBroker {
    sender: broadcast::Sender<Published>,
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of attached transports.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_BROKER_CAPACITY)
    }
}

#[derive(Default)]
struct Subscriptions {
    exact: HashSet<String>,
    patterns: HashSet<String>,
}

impl Subscriptions {
    fn deliveries(&self, published: &Published) -> Vec<RawMessage> {
        let mut out = Vec::new();
        if self.exact.contains(&published.channel) {
            out.push(RawMessage {
                channel: published.channel.clone(),
                pattern: None,
                payload: published.payload.clone(),
            });
        }
        for prefix in &self.patterns {
            if published.channel.starts_with(prefix.as_str()) {
                out.push(RawMessage {
                    channel: published.channel.clone(),
                    pattern: Some(prefix.clone()),
                    payload: published.payload.clone(),
                });
            }
        }
        out
    }
}

struct Listener {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<broadcast::Receiver<Published>>,
}

/// In-memory [`PubSubBackend`].
pub struct MemoryPubSub {
    broker: MemoryBroker,
    subscriptions: Arc<RwLock<Subscriptions>>,
    // Attached at construction so nothing published before `start` is lost.
    receiver: Mutex<Option<broadcast::Receiver<Published>>>,
    listener: Mutex<Option<Listener>>,
}

impl MemoryPubSub {
    pub fn new(broker: MemoryBroker) -> Self {
        let receiver = broker.sender.subscribe();
        Self {
            broker,
            subscriptions: Arc::default(),
            receiver: Mutex::new(Some(receiver)),
            listener: Mutex::new(None),
        }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl PubSubBackend for MemoryPubSub {
    fn name(&self) -> &str {
        "memory"
    }

    async fn subscribe(&self, channels: &[String], kind: ChannelKind) -> Result<()> {
        let mut subs = self.subscriptions.write();
        let target = match kind {
            ChannelKind::Exact => &mut subs.exact,
            ChannelKind::Pattern => &mut subs.patterns,
        };
        target.extend(channels.iter().cloned());
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[String]) -> Result<()> {
        let mut subs = self.subscriptions.write();
        for channel in channels {
            subs.exact.remove(channel);
            subs.patterns.remove(channel);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let receivers = self
            .broker
            .sender
            .send(Published {
                channel: channel.to_string(),
                payload: payload.to_string(),
            })
            .unwrap_or(0);
        Ok(receivers)
    }

    async fn start(&self, sink: Arc<dyn MessageSink>) -> Result<()> {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return Err(RouterError::PubSub("listener already running".to_string()));
        }
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| RouterError::PubSub("listener receiver unavailable".to_string()))?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(listen(
            receiver,
            Arc::clone(&self.subscriptions),
            sink,
            shutdown_rx,
        ));
        *listener = Some(Listener { shutdown, handle });

        info!(backend = "memory", "Pub/Sub listener started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(listener) = self.listener.lock().take() else {
            return Ok(());
        };

        let _ = listener.shutdown.send(());
        let receiver = listener
            .handle
            .await
            .map_err(|e| RouterError::PubSub(format!("listener task failed: {}", e)))?;
        *self.receiver.lock() = Some(receiver);

        info!(backend = "memory", "Pub/Sub listener stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.listener.lock().is_some()
    }
}

async fn listen(
    mut receiver: broadcast::Receiver<Published>,
    subscriptions: Arc<RwLock<Subscriptions>>,
    sink: Arc<dyn MessageSink>,
    mut shutdown: oneshot::Receiver<()>,
) -> broadcast::Receiver<Published> {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            received = receiver.recv() => match received {
                Ok(published) => {
                    let deliveries = subscriptions.read().deliveries(&published);
                    for raw in deliveries {
                        debug!(channel = %raw.channel, "Delivering in-memory message");
                        sink.deliver(raw).await;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "In-memory listener lagged; messages dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    receiver
}
