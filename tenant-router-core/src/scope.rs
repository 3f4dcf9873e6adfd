//! Request and task boundaries.
//!
//! [`TenantScope`] wraps one unit of work: it drains the deferred queue,
//! binds the unit to its tenant, runs it, unbinds, and drains again. Queued
//! lifecycle changes therefore become visible to the next unit of work,
//! never halfway through the current one.

use crate::context::ContextStack;
use crate::error::Result;
use crate::queue::{DeferredEventQueue, DrainReport};
use crate::resolver::{RequestParts, TenantIdResolver};
use crate::tenant::TenantRegistry;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Binds requests and background tasks to their tenant.
pub struct TenantScope {
    resolver: Arc<dyn TenantIdResolver>,
    tenants: Arc<TenantRegistry>,
    queue: Arc<DeferredEventQueue>,
    whitelist: Vec<String>,
}

impl TenantScope {
    pub fn new(
        resolver: Arc<dyn TenantIdResolver>,
        tenants: Arc<TenantRegistry>,
        queue: Arc<DeferredEventQueue>,
    ) -> Self {
        Self {
            resolver,
            tenants,
            queue,
            whitelist: Vec::new(),
        }
    }

    /// Paths served under the base context without tenant resolution.
    pub fn with_whitelist<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn tenants(&self) -> &Arc<TenantRegistry> {
        &self.tenants
    }

    pub fn queue(&self) -> &Arc<DeferredEventQueue> {
        &self.queue
    }

    /// Whether `path` is an entry of the whitelist or lies beneath one.
    pub fn is_whitelisted(&self, path: &str) -> bool {
        self.whitelist.iter().any(|entry| {
            let entry = entry.trim_end_matches('/');
            path == entry
                || path
                    .strip_prefix(entry)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Apply every queued lifecycle change now.
    pub async fn drain(&self) -> DrainReport {
        let report = self.queue.process_queue().await;
        if report.executed > 0 {
            debug!(executed = report.executed, failed = report.failed, "Drained deferred events");
        }
        report
    }

    /// Run `work` as one request of the tenant `request` resolves to.
    ///
    /// Fails with `TenantIdResolve` when no id can be extracted and with
    /// `TenantNotFound` when the id is unknown to this process.
    pub async fn run_request<F: Future>(&self, request: &RequestParts, work: F) -> Result<F::Output> {
        self.drain().await;

        let outcome = ContextStack::scope(async {
            if self.is_whitelisted(&request.path) {
                debug!(path = %request.path, "Whitelisted path; running under base tenant");
                return Ok(work.await);
            }

            let tenant_id = self.resolver.resolve(request).await?;
            let tenant = self.tenants.resolve(&tenant_id).inspect_err(|e| {
                warn!(tenant_id = %tenant_id, error = %e, "Request for unknown tenant");
            })?;
            ContextStack::with_tenant(tenant, work).await
        })
        .await;

        self.drain().await;
        outcome
    }

    /// Run `work` as a background task of `tenant_id`.
    pub async fn run_task<F: Future>(&self, tenant_id: &str, work: F) -> Result<F::Output> {
        self.drain().await;

        let outcome = ContextStack::scope(async {
            let tenant = self.tenants.resolve(tenant_id)?;
            ContextStack::with_tenant(tenant, work).await
        })
        .await;

        self.drain().await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RouterError;
    use crate::queue::DeferredEvent;
    use crate::resolver::HeaderTenantIdResolver;
    use crate::tenant::TenantContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scope() -> TenantScope {
        TenantScope::new(
            Arc::new(HeaderTenantIdResolver::default()),
            Arc::new(TenantRegistry::from_ids(["acme.example.com"])),
            Arc::new(DeferredEventQueue::default()),
        )
        .with_whitelist(["/health"])
    }

    fn counting(counter: &Arc<AtomicUsize>) -> DeferredEvent {
        let counter = Arc::clone(counter);
        DeferredEvent::new("count", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_request_runs_under_resolved_tenant() {
        let scope = scope();
        let request = RequestParts::new("GET", "/users").with_header("x-tenant-id", "acme.example.com");

        let (current, depth) = scope
            .run_request(&request, async { (ContextStack::current(), ContextStack::depth()) })
            .await
            .unwrap();

        assert_eq!(current, TenantContext::new("acme.example.com"));
        assert_eq!(depth, 2);
        assert_eq!(ContextStack::depth(), 0);
    }

    #[tokio::test]
    async fn test_request_accepts_alias() {
        let scope = scope();
        let request = RequestParts::new("GET", "/users").with_header("x-tenant-id", "acme_example_com");

        let id = scope
            .run_request(&request, async { ContextStack::current().id().to_string() })
            .await
            .unwrap();
        assert_eq!(id, "acme.example.com");
    }

    #[tokio::test]
    async fn test_request_resolution_failures() {
        let scope = scope();

        let missing = RequestParts::new("GET", "/users");
        assert!(matches!(
            scope.run_request(&missing, async {}).await,
            Err(RouterError::TenantIdResolve(_))
        ));

        let unknown = RequestParts::new("GET", "/users").with_header("x-tenant-id", "globex");
        assert!(matches!(
            scope.run_request(&unknown, async {}).await,
            Err(RouterError::TenantNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_whitelisted_path_runs_as_base() {
        let scope = scope();
        assert!(scope.is_whitelisted("/health"));
        assert!(scope.is_whitelisted("/health/live"));
        assert!(!scope.is_whitelisted("/healthz"));

        let request = RequestParts::new("GET", "/health/live");
        let current = scope
            .run_request(&request, async { ContextStack::current() })
            .await
            .unwrap();
        assert!(current.is_base());
    }

    #[tokio::test]
    async fn test_drains_around_request() {
        let scope = scope();
        let applied = Arc::new(AtomicUsize::new(0));
        scope.queue().enqueue(counting(&applied));

        let request = RequestParts::new("GET", "/users").with_header("x-tenant-id", "acme.example.com");
        let queue = Arc::clone(scope.queue());
        let seen = Arc::clone(&applied);
        let counter = Arc::clone(&applied);
        let observed = scope
            .run_request(&request, async move {
                let observed = seen.load(Ordering::SeqCst);
                queue.enqueue(counting(&counter));
                observed
            })
            .await
            .unwrap();

        // Queued before the request: applied first. Queued during: applied after.
        assert_eq!(observed, 1);
        assert_eq!(applied.load(Ordering::SeqCst), 2);
        assert!(scope.queue().is_empty());
    }

    #[tokio::test]
    async fn test_task_drains_even_on_unknown_tenant() {
        let scope = scope();
        let applied = Arc::new(AtomicUsize::new(0));
        scope.queue().enqueue(counting(&applied));

        let result = scope.run_task("globex", async {}).await;

        assert!(matches!(result, Err(RouterError::TenantNotFound(_))));
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }
}
