//! Executor context propagation.
//!
//! Work handed to another task does not inherit task-locals. Submitting
//! through [`TenantAwareExecutor`] captures the tenant that is current at
//! submission and re-pushes it inside the spawned task for the duration of
//! the work, popping it again however the work ends.

use crate::context::ContextStack;
use crate::error::Result;
use crate::tenant::{TenantContext, TenantRegistry};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Spawns tasks that run under the submitting task's tenant.
#[derive(Clone, Default)]
pub struct TenantAwareExecutor {
    tenants: Option<Arc<TenantRegistry>>,
}

impl TenantAwareExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve id-carrying jobs through `tenants`.
    pub fn with_registry(tenants: Arc<TenantRegistry>) -> Self {
        Self {
            tenants: Some(tenants),
        }
    }

    /// Spawn `fut` on the runtime under the current tenant.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<Result<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let context = ContextStack::current();
        debug!(tenant_id = %context.id(), "Spawning tenant-aware task");
        tokio::spawn(ContextStack::scope(ContextStack::with_tenant(context, fut)))
    }

    /// Run a blocking closure on the blocking pool under the current tenant.
    pub fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<Result<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let context = ContextStack::current();
        debug!(tenant_id = %context.id(), "Spawning tenant-aware blocking task");
        tokio::task::spawn_blocking(move || {
            ContextStack::sync_scope(|| ContextStack::with_tenant_sync(context, f))
        })
    }

    /// Spawn a job that carries only a tenant id.
    ///
    /// The id is resolved when the job starts, against the registry as it
    /// is then; an unknown tenant fails the job with `TenantNotFound`.
    pub fn spawn_for_tenant<F>(&self, tenant_id: impl Into<String>, fut: F) -> JoinHandle<Result<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let tenant_id = tenant_id.into();
        let tenants = self.tenants.clone();
        tokio::spawn(ContextStack::scope(async move {
            let context = match &tenants {
                Some(tenants) => tenants.resolve(&tenant_id)?,
                None => TenantContext::new(tenant_id),
            };
            ContextStack::with_tenant(context, fut).await
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RouterError;
    use tokio::sync::oneshot;

    fn acme() -> TenantContext {
        TenantContext::new("acme.example.com")
    }

    #[tokio::test]
    async fn test_spawn_sees_submission_context() {
        let executor = TenantAwareExecutor::new();
        let (release, gate) = oneshot::channel::<()>();

        let handle = ContextStack::scope(async {
            let guard = ContextStack::enter(acme()).unwrap();
            let handle = executor.spawn(async move {
                gate.await.ok();
                (ContextStack::current(), ContextStack::depth())
            });
            drop(guard);
            handle
        })
        .await;

        release.send(()).unwrap();
        let (context, depth) = handle.await.unwrap().unwrap();
        assert_eq!(context, acme());
        assert_eq!(depth, 2);
    }

    #[tokio::test]
    async fn test_pushes_inside_spawned_task_stay_in_task() {
        let executor = TenantAwareExecutor::new();
        let globex = TenantContext::new("globex");
        let (pushed, seen) = oneshot::channel();
        let (release, gate) = oneshot::channel::<()>();

        ContextStack::scope(async {
            let _guard = ContextStack::enter(acme()).unwrap();
            let inner = globex.clone();
            let handle = executor.spawn(async move {
                let _guard = ContextStack::enter(inner).unwrap();
                pushed.send((ContextStack::current(), ContextStack::depth())).ok();
                gate.await.ok();
                ContextStack::depth()
            });

            let (context, depth) = seen.await.unwrap();
            assert_eq!(context, globex);
            assert_eq!(depth, 3);

            assert!(!handle.is_finished());
            assert_eq!(ContextStack::current(), acme());
            assert_eq!(ContextStack::depth(), 2);

            release.send(()).unwrap();
            assert_eq!(handle.await.unwrap().unwrap(), 3);
            assert_eq!(ContextStack::current(), acme());
            assert_eq!(ContextStack::depth(), 2);
        })
        .await;
    }

    #[tokio::test]
    async fn test_spawn_outside_scope_runs_as_base() {
        let executor = TenantAwareExecutor::new();
        let context = executor
            .spawn(async { ContextStack::current() })
            .await
            .unwrap()
            .unwrap();
        assert!(context.is_base());
    }

    #[tokio::test]
    async fn test_spawn_blocking_propagates() {
        let executor = TenantAwareExecutor::new();
        let handle = ContextStack::scope(async {
            let _guard = ContextStack::enter(acme()).unwrap();
            executor.spawn_blocking(|| ContextStack::current().alias().to_string())
        })
        .await;

        assert_eq!(handle.await.unwrap().unwrap(), "acme_example_com");
    }

    #[tokio::test]
    async fn test_failed_task_leaves_caller_untouched() {
        let executor = TenantAwareExecutor::new();
        ContextStack::scope(async {
            let _guard = ContextStack::enter(acme()).unwrap();
            let handle = executor.spawn(async {
                Err::<(), _>(RouterError::UnknownAlias("missing".to_string()))
            });
            assert!(handle.await.unwrap().unwrap().is_err());

            let handle = executor.spawn(async {
                Option::<()>::None.expect("job exploded");
            });
            assert!(handle.await.unwrap_err().is_panic());

            assert_eq!(ContextStack::current(), acme());
            assert_eq!(ContextStack::depth(), 2);
        })
        .await;
    }

    #[tokio::test]
    async fn test_spawn_for_tenant_resolves_at_start() {
        let tenants = Arc::new(TenantRegistry::from_ids(["acme.example.com"]));
        let executor = TenantAwareExecutor::with_registry(Arc::clone(&tenants));

        let context = executor
            .spawn_for_tenant("acme_example_com", async { ContextStack::current() })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(context.id(), "acme.example.com");

        let missing = executor
            .spawn_for_tenant("globex", async { ContextStack::current() })
            .await
            .unwrap();
        assert!(matches!(missing, Err(RouterError::TenantNotFound(_))));
    }
}
