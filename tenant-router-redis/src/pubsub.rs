//! Redis lifecycle bus.
//!
//! A single listener task owns the subscriber connection. Subscription
//! changes are recorded and queued for it; they are applied between read
//! bursts, so handlers running inside the listener may subscribe without
//! waiting on it. The task idles between bursts and reconnects with capped
//! backoff when the connection drops, re-subscribing everything recorded
//! so far.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use redis::aio::{ConnectionManager, PubSub};
use redis::{Client, Msg, RedisResult};
use std::collections::BTreeSet;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tenant_router_core::{
    ChannelKind, MessageSink, PubSubBackend, PubSubSettings, RawMessage, RouterError,
};
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{RedisConfig, RedisError};

type BusResult<T> = std::result::Result<T, RouterError>;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Read loop cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Messages read before the loop idles.
    pub read_burst: usize,
    /// Pause after a burst that came back short.
    pub idle: Duration,
    /// How long a single read waits. Expiry is not an error.
    pub read_timeout: Duration,
    /// Upper bound for the reconnect delay.
    pub max_backoff: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            read_burst: 5,
            idle: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl From<&PubSubSettings> for ListenerConfig {
    fn from(settings: &PubSubSettings) -> Self {
        Self {
            read_burst: settings.read_burst.max(1),
            idle: settings.idle(),
            read_timeout: settings.read_timeout(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Subscriptions {
    exact: BTreeSet<String>,
    patterns: BTreeSet<String>,
}

impl Subscriptions {
    fn record(&mut self, channels: &[String], kind: ChannelKind) {
        let target = match kind {
            ChannelKind::Exact => &mut self.exact,
            ChannelKind::Pattern => &mut self.patterns,
        };
        target.extend(channels.iter().cloned());
    }

    fn forget(&mut self, channels: &[String]) {
        for channel in channels {
            self.exact.remove(channel);
            self.patterns.remove(channel);
        }
    }
}

/// Redis glob matching every channel that starts with `prefix`.
pub(crate) fn prefix_glob(prefix: &str) -> String {
    let mut glob = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            glob.push('\\');
        }
        glob.push(c);
    }
    glob.push('*');
    glob
}

/// Inverse of [`prefix_glob`].
pub(crate) fn prefix_from_glob(glob: &str) -> String {
    let body = glob.strip_suffix('*').unwrap_or(glob);
    let mut prefix = String::with_capacity(body.len());
    let mut escaped = false;
    for c in body.chars() {
        if c == '\\' && !escaped {
            escaped = true;
            continue;
        }
        escaped = false;
        prefix.push(c);
    }
    prefix
}

enum Change {
    Subscribe(Vec<String>, ChannelKind),
    Unsubscribe(Vec<String>),
}

struct Listener {
    shutdown: oneshot::Sender<()>,
    changes: mpsc::UnboundedSender<Change>,
    handle: JoinHandle<()>,
}

/// Redis [`PubSubBackend`].
pub struct RedisPubSub {
    client: Client,
    config: ListenerConfig,
    publisher: OnceCell<ConnectionManager>,
    subscriptions: Arc<RwLock<Subscriptions>>,
    listener: Mutex<Option<Listener>>,
}

impl RedisPubSub {
    /// Create a bus for `config`. No connection is opened until use.
    pub fn new(config: &RedisConfig, listener: ListenerConfig) -> crate::Result<Self> {
        let client = Client::open(config.connection_url()?)?;
        Ok(Self::from_client(client, listener))
    }

    pub fn from_client(client: Client, config: ListenerConfig) -> Self {
        Self {
            client,
            config,
            publisher: OnceCell::new(),
            subscriptions: Arc::default(),
            listener: Mutex::new(None),
        }
    }

    pub fn listener_config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Exact channels currently recorded.
    pub fn channels(&self) -> Vec<String> {
        self.subscriptions.read().exact.iter().cloned().collect()
    }

    /// Pattern prefixes currently recorded.
    pub fn patterns(&self) -> Vec<String> {
        self.subscriptions.read().patterns.iter().cloned().collect()
    }

    async fn publisher(&self) -> BusResult<ConnectionManager> {
        let manager = self
            .publisher
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .map_err(|e| RedisError::from(e).into_pubsub())?;
        Ok(manager.clone())
    }

    /// Queue a change for the running listener.
    ///
    /// Without a listener the recorded state is applied on the next start.
    fn request(&self, change: Change) {
        if let Some(listener) = self.listener.lock().as_ref()
            && listener.changes.send(change).is_err()
        {
            debug!("Listener gone; change kept for the next start");
        }
    }
}

#[async_trait]
impl PubSubBackend for RedisPubSub {
    fn name(&self) -> &str {
        "redis"
    }

    async fn subscribe(&self, channels: &[String], kind: ChannelKind) -> BusResult<()> {
        self.subscriptions.write().record(channels, kind);
        self.request(Change::Subscribe(channels.to_vec(), kind));
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[String]) -> BusResult<()> {
        self.subscriptions.write().forget(channels);
        self.request(Change::Unsubscribe(channels.to_vec()));
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> BusResult<usize> {
        let mut conn = self.publisher().await?;
        let receivers: usize = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisError::from(e).into_pubsub())?;
        debug!(channel = %channel, receivers, "Published message");
        Ok(receivers)
    }

    async fn start(&self, sink: Arc<dyn MessageSink>) -> BusResult<()> {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return Err(RouterError::PubSub("listener already running".to_string()));
        }

        let (changes, changes_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = ListenerTask {
            client: self.client.clone(),
            subscriptions: Arc::clone(&self.subscriptions),
            sink,
            config: self.config.clone(),
            changes: changes_rx,
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(task.run());
        *listener = Some(Listener {
            shutdown,
            changes,
            handle,
        });

        info!(backend = "redis", "Pub/Sub listener started");
        Ok(())
    }

    async fn stop(&self) -> BusResult<()> {
        let Some(listener) = self.listener.lock().take() else {
            return Ok(());
        };

        let _ = listener.shutdown.send(());
        listener
            .handle
            .await
            .map_err(|e| RouterError::PubSub(format!("listener task failed: {}", e)))?;

        info!(backend = "redis", "Pub/Sub listener stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.listener.lock().is_some()
    }
}

enum Exit {
    Stopped,
    Disconnected,
}

enum Wake {
    Stop,
    Change(Option<Change>),
    Idle,
}

struct ListenerTask {
    client: Client,
    subscriptions: Arc<RwLock<Subscriptions>>,
    sink: Arc<dyn MessageSink>,
    config: ListenerConfig,
    changes: mpsc::UnboundedReceiver<Change>,
    shutdown: oneshot::Receiver<()>,
}

impl ListenerTask {
    async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let pubsub = match self.connect().await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    error!(
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Redis pub/sub connection failed"
                    );
                    if self.wait(backoff).await {
                        return;
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    continue;
                }
            };

            backoff = INITIAL_BACKOFF;
            info!(backend = "redis", "Pub/Sub connected");

            match self.serve(pubsub).await {
                Exit::Stopped => return,
                Exit::Disconnected => warn!("Redis pub/sub connection lost, reconnecting"),
            }
        }
    }

    async fn connect(&self) -> RedisResult<PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        let recorded = self.subscriptions.read().clone();

        for channel in &recorded.exact {
            pubsub.subscribe(channel.as_str()).await?;
        }
        for prefix in &recorded.patterns {
            pubsub.psubscribe(prefix_glob(prefix)).await?;
        }

        debug!(
            channels = recorded.exact.len(),
            patterns = recorded.patterns.len(),
            "Subscriptions restored"
        );
        Ok(pubsub)
    }

    /// Sleep out a reconnect delay. Returns true when asked to stop.
    async fn wait(&mut self, period: Duration) -> bool {
        let sleep = tokio::time::sleep(period);
        let mut sleep = pin!(sleep);

        loop {
            let wake = tokio::select! {
                _ = &mut self.shutdown => Wake::Stop,
                change = self.changes.recv() => Wake::Change(change),
                _ = &mut sleep => Wake::Idle,
            };

            match wake {
                Wake::Stop | Wake::Change(None) => return true,
                // Recorded already; applied by the next connect
                Wake::Change(Some(_)) => {}
                Wake::Idle => return false,
            }
        }
    }

    async fn serve(&mut self, mut pubsub: PubSub) -> Exit {
        loop {
            match self.shutdown.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => {}
                _ => return Exit::Stopped,
            }

            while let Ok(change) = self.changes.try_recv() {
                if !self.apply(&mut pubsub, change).await {
                    return Exit::Disconnected;
                }
            }

            let Some(received) = self.read_burst(&mut pubsub).await else {
                return Exit::Disconnected;
            };
            if received >= self.config.read_burst {
                continue;
            }

            let wake = tokio::select! {
                _ = &mut self.shutdown => Wake::Stop,
                change = self.changes.recv() => Wake::Change(change),
                _ = tokio::time::sleep(self.config.idle) => Wake::Idle,
            };

            match wake {
                Wake::Stop | Wake::Change(None) => return Exit::Stopped,
                Wake::Change(Some(change)) => {
                    if !self.apply(&mut pubsub, change).await {
                        return Exit::Disconnected;
                    }
                }
                Wake::Idle => {}
            }
        }
    }

    /// Returns the number of messages read, or `None` once the connection is gone.
    async fn read_burst(&self, pubsub: &mut PubSub) -> Option<usize> {
        let mut stream = pin!(pubsub.on_message());
        let mut received = 0;

        while received < self.config.read_burst {
            match tokio::time::timeout(self.config.read_timeout, stream.next()).await {
                Ok(Some(msg)) => {
                    received += 1;
                    if let Some(raw) = raw_message(&msg) {
                        self.sink.deliver(raw).await;
                    }
                }
                Ok(None) => return None,
                Err(_) => break,
            }
        }

        Some(received)
    }

    /// Apply a subscription change. Returns false when the connection failed;
    /// the recorded state is replayed after reconnecting.
    async fn apply(&self, pubsub: &mut PubSub, change: Change) -> bool {
        match apply_change(pubsub, &change).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Subscription change failed");
                false
            }
        }
    }
}

async fn apply_change(pubsub: &mut PubSub, change: &Change) -> RedisResult<()> {
    match change {
        Change::Subscribe(channels, ChannelKind::Exact) => {
            for channel in channels {
                pubsub.subscribe(channel.as_str()).await?;
            }
        }
        Change::Subscribe(channels, ChannelKind::Pattern) => {
            for prefix in channels {
                pubsub.psubscribe(prefix_glob(prefix)).await?;
            }
        }
        Change::Unsubscribe(channels) => {
            for channel in channels {
                pubsub.unsubscribe(channel.as_str()).await?;
                pubsub.punsubscribe(prefix_glob(channel)).await?;
            }
        }
    }
    Ok(())
}

fn raw_message(msg: &Msg) -> Option<RawMessage> {
    let payload: String = match msg.get_payload() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(channel = %msg.get_channel_name(), error = %e, "Dropping undecodable message");
            return None;
        }
    };

    let pattern = if msg.from_pattern() {
        msg.get_pattern::<String>()
            .ok()
            .map(|glob| prefix_from_glob(&glob))
    } else {
        None
    };

    Some(RawMessage {
        channel: msg.get_channel_name().to_string(),
        pattern,
        payload,
    })
}
