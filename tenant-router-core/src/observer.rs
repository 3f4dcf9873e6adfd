//! Lifecycle Observer
//!
//! Bridges the bus and the deferred queue. For every lifecycle message it
//!
//! 1. performs channel bookkeeping immediately: a created tenant starts
//!    receiving its own update/delete channels right away, a deleted one
//!    stops;
//! 2. gathers the `on_` subscribers followed by the paired `post_` ones;
//! 3. enqueues them as one deferred unit, applied at the next drain point.
//!
//! Within a kind the most recently registered subscriber runs first, which
//! lets late-bootstrapped components act before earlier ones.

use crate::alias::AliasCodec;
use crate::error::{Result, RouterError};
use crate::lifecycle::{LifecycleEvent, LifecycleKind, LifecycleSubscriber};
use crate::pubsub::{ChannelHandler, ChannelKind, NormalizedEvent, PubSubProxy};
use crate::queue::{DeferredEvent, DeferredEventQueue};
use crate::tenant::TenantContext;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Subscribes to lifecycle channels and schedules subscriber work.
pub struct LifecycleObserver {
    me: Weak<LifecycleObserver>,
    codec: Arc<AliasCodec>,
    proxy: Arc<PubSubProxy>,
    queue: Arc<DeferredEventQueue>,
    subscribers: RwLock<HashMap<LifecycleKind, Vec<Arc<dyn LifecycleSubscriber>>>>,
}

impl LifecycleObserver {
    pub fn new(
        codec: Arc<AliasCodec>,
        proxy: Arc<PubSubProxy>,
        queue: Arc<DeferredEventQueue>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            codec,
            proxy,
            queue,
            subscribers: RwLock::new(HashMap::new()),
        })
    }

    pub fn proxy(&self) -> &Arc<PubSubProxy> {
        &self.proxy
    }

    pub fn queue(&self) -> &Arc<DeferredEventQueue> {
        &self.queue
    }

    /// Register a subscriber for `kind`. It runs before every earlier one.
    pub fn subscribe(&self, kind: LifecycleKind, subscriber: Arc<dyn LifecycleSubscriber>) {
        debug!(event = %kind, subscriber = %subscriber.name(), "Lifecycle subscriber registered");
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .insert(0, subscriber);
    }

    /// Subscribers of `kind` in execution order.
    pub fn subscribers(&self, kind: LifecycleKind) -> Vec<Arc<dyn LifecycleSubscriber>> {
        self.subscribers
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    /// `on_` subscribers of `kind` followed by its `post_` subscribers.
    pub fn chain(&self, kind: LifecycleKind) -> Vec<Arc<dyn LifecycleSubscriber>> {
        let mut chain = self.subscribers(kind);
        if !kind.is_post() {
            chain.extend(self.subscribers(kind.post()));
        }
        chain
    }

    /// Tenant-scoped channels carrying `tenant`'s own lifecycle events.
    pub fn tenant_channels(&self, tenant: &TenantContext) -> Vec<String> {
        [LifecycleKind::OnTenantUpdate, LifecycleKind::OnTenantDelete]
            .iter()
            .map(|kind| kind.channel(&self.codec, tenant))
            .collect()
    }

    /// Subscribe to the global create channel and every known tenant's channels.
    pub async fn observe(&self, tenants: &[TenantContext]) -> Result<()> {
        let handler = self.handler()?;
        let mut channels = vec![(
            LifecycleKind::OnTenantCreate.as_str().to_string(),
            Arc::clone(&handler),
        )];
        for tenant in tenants {
            channels.extend(
                self.tenant_channels(tenant)
                    .into_iter()
                    .map(|channel| (channel, Arc::clone(&handler))),
            );
        }

        let count = channels.len();
        self.proxy.subscribe(channels, ChannelKind::Exact).await?;
        info!(channels = count, tenants = tenants.len(), "Observing tenant lifecycle channels");
        Ok(())
    }

    /// Start receiving `tenant`'s update/delete events.
    pub async fn watch_tenant(&self, tenant: &TenantContext) -> Result<()> {
        let handler = self.handler()?;
        let channels = self
            .tenant_channels(tenant)
            .into_iter()
            .map(|channel| (channel, Arc::clone(&handler)));
        self.proxy.subscribe(channels, ChannelKind::Exact).await
    }

    /// Stop receiving `tenant`'s update/delete events.
    pub async fn unwatch_tenant(&self, tenant: &TenantContext) -> Result<()> {
        self.proxy.unsubscribe(&self.tenant_channels(tenant)).await
    }

    /// Turn a bus message into a deferred unit of subscriber work.
    pub async fn schedule(&self, event: NormalizedEvent) -> Result<()> {
        let channel = event.channel;
        let lifecycle = match LifecycleEvent::from_value(event.data) {
            Ok(lifecycle) => lifecycle,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Dropping malformed lifecycle message");
                return Ok(());
            }
        };

        let kind = lifecycle.lifecycle_event;
        if kind.is_post() {
            warn!(channel = %channel, event = %kind, "Dropping post_ event received from the bus");
            return Ok(());
        }

        self.track(&lifecycle).await;

        let chain = self.chain(kind);
        let name = format!("{}:{}", kind, lifecycle.tenant_id);
        debug!(event = %name, subscribers = chain.len(), "Scheduling lifecycle event");
        self.queue.enqueue(DeferredEvent::new(name, move || async move {
            run_chain(&chain, &lifecycle).await
        }));

        Ok(())
    }

    /// Run the subscriber chain for `event` now, on the caller's task.
    ///
    /// Used by the process that originates a change, which must not wait
    /// for its own broadcast to come back.
    pub async fn apply_local(&self, event: &LifecycleEvent) -> Result<()> {
        self.track(event).await;
        run_chain(&self.chain(event.lifecycle_event), event).await
    }

    /// Follow a created tenant's channels, drop a deleted one's.
    async fn track(&self, event: &LifecycleEvent) {
        let tenant = event.tenant();
        let outcome = match event.lifecycle_event {
            LifecycleKind::OnTenantCreate => self.watch_tenant(&tenant).await,
            LifecycleKind::OnTenantDelete => self.unwatch_tenant(&tenant).await,
            _ => Ok(()),
        };
        if let Err(e) = outcome {
            error!(
                tenant_id = %tenant.id(),
                event = %event.lifecycle_event,
                error = %e,
                "Channel bookkeeping failed"
            );
        }
    }

    fn handler(&self) -> Result<Arc<dyn ChannelHandler>> {
        self.me
            .upgrade()
            .map(|me| me as Arc<dyn ChannelHandler>)
            .ok_or_else(|| RouterError::PubSub("lifecycle observer has been dropped".to_string()))
    }
}

/// Run subscribers in order, stopping at the first failure: `post_`
/// subscribers rely on the `on_` ones having been applied.
async fn run_chain(chain: &[Arc<dyn LifecycleSubscriber>], event: &LifecycleEvent) -> Result<()> {
    for subscriber in chain {
        if let Err(e) = subscriber.on_event(event).await {
            warn!(
                subscriber = %subscriber.name(),
                tenant_id = %event.tenant_id,
                event = %event.lifecycle_event,
                error = %e,
                "Lifecycle subscriber failed"
            );
            return Err(e);
        }
    }
    Ok(())
}

#[async_trait]
impl ChannelHandler for LifecycleObserver {
    async fn handle(&self, event: NormalizedEvent) -> Result<()> {
        self.schedule(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{MemoryBroker, MemoryPubSub};
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl LifecycleSubscriber for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_event(&self, event: &LifecycleEvent) -> Result<()> {
            self.log
                .lock()
                .push(format!("{}:{}", self.name, event.lifecycle_event));
            if self.fail {
                return Err(RouterError::TenantNotFound(event.tenant_id.clone()));
            }
            Ok(())
        }
    }

    fn recorder(name: &str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> Arc<dyn LifecycleSubscriber> {
        Arc::new(Recorder {
            name: name.to_string(),
            log: Arc::clone(log),
            fail,
        })
    }

    fn observer() -> Arc<LifecycleObserver> {
        let codec = Arc::new(AliasCodec::new("svc", ["relational-db"]).unwrap());
        let proxy = Arc::new(PubSubProxy::new(Arc::new(MemoryPubSub::new(MemoryBroker::default()))));
        LifecycleObserver::new(codec, proxy, Arc::new(DeferredEventQueue::default()))
    }

    fn message(kind: &str, tenant_id: &str) -> NormalizedEvent {
        NormalizedEvent {
            channel: kind.to_string(),
            kind: ChannelKind::Exact,
            data: json!({"tenant_id": tenant_id, "lifecycle_event": kind}),
        }
    }

    #[tokio::test]
    async fn test_last_registered_runs_first_then_post() {
        let observer = observer();
        let log = Arc::new(Mutex::new(Vec::new()));
        observer.subscribe(LifecycleKind::PostTenantCreate, recorder("post", &log, false));
        observer.subscribe(LifecycleKind::OnTenantCreate, recorder("first", &log, false));
        observer.subscribe(LifecycleKind::OnTenantCreate, recorder("second", &log, false));

        observer
            .schedule(message("on_tenant_create", "acme.example.com"))
            .await
            .unwrap();
        assert!(log.lock().is_empty());
        assert_eq!(observer.queue().len(), 1);

        observer.queue().process_queue().await;
        assert_eq!(
            *log.lock(),
            vec![
                "second:on_tenant_create",
                "first:on_tenant_create",
                "post:on_tenant_create"
            ]
        );
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_failure() {
        let observer = observer();
        let log = Arc::new(Mutex::new(Vec::new()));
        observer.subscribe(LifecycleKind::PostTenantUpdate, recorder("post", &log, false));
        observer.subscribe(LifecycleKind::OnTenantUpdate, recorder("broken", &log, true));

        observer
            .schedule(message("on_tenant_update", "acme.example.com"))
            .await
            .unwrap();
        let report = observer.queue().process_queue().await;

        assert_eq!(report.failed, 1);
        assert_eq!(*log.lock(), vec!["broken:on_tenant_update"]);
    }

    #[tokio::test]
    async fn test_create_and_delete_bookkeeping_is_immediate() {
        let observer = observer();
        observer.observe(&[]).await.unwrap();
        assert_eq!(observer.proxy().channels(), vec!["on_tenant_create"]);

        observer
            .schedule(message("on_tenant_create", "acme.example.com"))
            .await
            .unwrap();
        assert!(observer.proxy().is_subscribed("acme_example_com_svc_on_tenant_update"));
        assert!(observer.proxy().is_subscribed("acme_example_com_svc_on_tenant_delete"));

        observer
            .schedule(message("on_tenant_delete", "acme.example.com"))
            .await
            .unwrap();
        assert_eq!(observer.proxy().channels(), vec!["on_tenant_create"]);
        assert_eq!(observer.queue().len(), 2);
    }

    #[tokio::test]
    async fn test_observe_known_tenants() {
        let observer = observer();
        observer
            .observe(&[TenantContext::new("acme.example.com"), TenantContext::new("globex")])
            .await
            .unwrap();

        assert_eq!(observer.proxy().channels().len(), 5);
        assert!(observer.proxy().is_subscribed("globex_svc_on_tenant_delete"));
    }

    #[tokio::test]
    async fn test_malformed_and_post_messages_are_dropped() {
        let observer = observer();
        observer
            .schedule(NormalizedEvent {
                channel: "on_tenant_create".to_string(),
                kind: ChannelKind::Exact,
                data: json!("garbage"),
            })
            .await
            .unwrap();
        observer
            .schedule(message("post_tenant_create", "acme"))
            .await
            .unwrap();

        assert!(observer.queue().is_empty());
    }

    #[tokio::test]
    async fn test_apply_local_runs_immediately() {
        let observer = observer();
        let log = Arc::new(Mutex::new(Vec::new()));
        observer.subscribe(LifecycleKind::OnTenantDelete, recorder("r", &log, false));

        let event = LifecycleEvent::new("acme", LifecycleKind::OnTenantDelete);
        observer.apply_local(&event).await.unwrap();

        assert_eq!(*log.lock(), vec!["r:on_tenant_delete"]);
        assert!(observer.queue().is_empty());
    }
}
