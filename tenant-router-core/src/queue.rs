//! Deferred event queue.
//!
//! Lifecycle work received from the bus is not applied on the listener
//! task. It is queued here and executed at drain points: the start and
//! end of every request and background task. A bounded [`VecDeque`]
//! holds pending work; when full, the oldest entry is dropped, since later
//! lifecycle events re-apply complete configuration rather than deltas.

use crate::error::{Result, RouterError};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

type Callback = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A single-use unit of deferred work.
///
/// Running consumes the event, so it can execute at most once.
pub struct DeferredEvent {
    name: String,
    callback: Callback,
    enqueued_at: DateTime<Utc>,
}

impl DeferredEvent {
    pub fn new<F, Fut>(name: impl Into<String>, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            callback: Box::new(move || callback().boxed()),
            enqueued_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Execute the callback, converting a panic into an error.
    pub async fn run(self) -> Result<()> {
        let name = self.name;
        match AssertUnwindSafe((self.callback)()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                Err(RouterError::Panicked(format!("{}: {}", name, message)))
            }
        }
    }
}

impl std::fmt::Debug for DeferredEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredEvent")
            .field("name", &self.name)
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub executed: usize,
    pub failed: usize,
}

/// Bounded FIFO of deferred events.
pub struct DeferredEventQueue {
    capacity: usize,
    entries: Mutex<VecDeque<DeferredEvent>>,
    drain_gate: tokio::sync::Mutex<()>,
    dropped: AtomicU64,
}

impl DeferredEventQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            drain_gate: tokio::sync::Mutex::new(()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Entries discarded on overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Names of the queued events, oldest first.
    pub fn pending(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.name.clone()).collect()
    }

    /// Append an event, returning the oldest one if it had to be dropped.
    pub fn enqueue(&self, event: DeferredEvent) -> Option<DeferredEvent> {
        let mut entries = self.entries.lock();
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };
        debug!(event = %event.name, queued = entries.len() + 1, "Deferred event queued");
        entries.push_back(event);
        drop(entries);

        if let Some(old) = &evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(event = %old.name, capacity = self.capacity, "Deferred queue full; dropped oldest event");
        }
        evicted
    }

    /// Run every event queued at the time of the call, in order.
    ///
    /// Failures and panics are logged and do not stop the drain. Events
    /// queued while draining wait for the next drain point.
    pub async fn process_queue(&self) -> DrainReport {
        let _gate = self.drain_gate.lock().await;
        let batch: Vec<DeferredEvent> = self.entries.lock().drain(..).collect();

        let mut report = DrainReport::default();
        for event in batch {
            let name = event.name.clone();
            let waited_ms = (Utc::now() - event.enqueued_at).num_milliseconds();
            report.executed += 1;

            match event.run().await {
                Ok(()) => debug!(event = %name, waited_ms, "Deferred event applied"),
                Err(e) => {
                    report.failed += 1;
                    error!(event = %name, waited_ms, error = %e, "Deferred event failed");
                }
            }
        }

        report
    }
}

impl Default for DeferredEventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recording(log: &Arc<Mutex<Vec<usize>>>, n: usize) -> DeferredEvent {
        let log = Arc::clone(log);
        DeferredEvent::new(format!("event-{}", n), move || async move {
            log.lock().push(n);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = DeferredEventQueue::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        for n in 0..5 {
            queue.enqueue(recording(&log, n));
        }

        let report = queue.process_queue().await;

        assert_eq!(report, DrainReport { executed: 5, failed: 0 });
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let queue = DeferredEventQueue::new(DEFAULT_QUEUE_CAPACITY);
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut evicted = Vec::new();
        for n in 0..51 {
            if let Some(old) = queue.enqueue(recording(&log, n)) {
                evicted.push(old.name().to_string());
            }
        }

        assert_eq!(queue.len(), 50);
        assert_eq!(evicted, vec!["event-0"]);
        assert_eq!(queue.dropped(), 1);

        queue.process_queue().await;
        assert_eq!(*log.lock(), (1..51).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_drain() {
        let queue = DeferredEventQueue::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.enqueue(recording(&log, 1));
        queue.enqueue(DeferredEvent::new("fails", || async {
            Err(RouterError::TenantNotFound("gone".to_string()))
        }));
        queue.enqueue(DeferredEvent::new("panics", || async {
            let payload: Option<()> = None;
            payload.expect("bad tenant payload");
            Ok(())
        }));
        queue.enqueue(recording(&log, 2));

        let report = queue.process_queue().await;

        assert_eq!(report, DrainReport { executed: 4, failed: 2 });
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_events_queued_during_drain_wait() {
        let queue = Arc::new(DeferredEventQueue::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner_queue = Arc::clone(&queue);
        let inner_log = Arc::clone(&log);
        queue.enqueue(DeferredEvent::new("requeues", move || async move {
            inner_queue.enqueue(recording(&inner_log, 99));
            Ok(())
        }));

        assert_eq!(queue.process_queue().await.executed, 1);
        assert!(log.lock().is_empty());
        assert_eq!(queue.pending(), vec!["event-99"]);

        queue.process_queue().await;
        assert_eq!(*log.lock(), vec![99]);
    }

    #[tokio::test]
    async fn test_panic_message_is_reported() {
        let event = DeferredEvent::new("p", || async {
            let payload: Option<()> = None;
            payload.expect("boom");
            Ok(())
        });
        let err = event.run().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
