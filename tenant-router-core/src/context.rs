//! Task-local tenant context stack.
//!
//! Every unit of work runs inside a [`ContextStack::scope`] (or
//! [`ContextStack::sync_scope`] for blocking code). The scope owns a fresh
//! stack seeded with the base tenant, so concurrent units of work never
//! observe each other's pushes. Work handed to another task must capture
//! [`ContextStack::current`] and re-enter it there; see
//! [`TenantAwareExecutor`](crate::executor::TenantAwareExecutor).

use crate::error::{Result, RouterError};
use crate::tenant::TenantContext;
use std::cell::RefCell;
use std::future::Future;

tokio::task_local! {
    static TENANT_STACK: RefCell<Vec<TenantContext>>;
}

/// Access to the current task's tenant stack.
pub struct ContextStack;

impl ContextStack {
    /// Run `fut` with a fresh stack holding only the base context.
    pub async fn scope<F: Future>(fut: F) -> F::Output {
        TENANT_STACK
            .scope(RefCell::new(vec![TenantContext::base()]), fut)
            .await
    }

    /// Run a blocking closure with a fresh stack holding only the base context.
    pub fn sync_scope<R>(f: impl FnOnce() -> R) -> R {
        TENANT_STACK.sync_scope(RefCell::new(vec![TenantContext::base()]), f)
    }

    /// Whether the caller runs inside a scope.
    pub fn is_active() -> bool {
        TENANT_STACK.try_with(|_| ()).is_ok()
    }

    /// Push `context` onto the current task's stack.
    pub fn push(context: TenantContext) -> Result<()> {
        if context.is_empty() {
            return Err(RouterError::InvalidContext(format!("{:?}", context)));
        }

        TENANT_STACK
            .try_with(|stack| stack.borrow_mut().push(context))
            .map_err(|_| RouterError::NoActiveScope)
    }

    /// Remove and return the top context. The base context is never popped.
    pub fn pop() -> Result<TenantContext> {
        TENANT_STACK
            .try_with(|stack| {
                let mut stack = stack.borrow_mut();
                if stack.len() <= 1 {
                    return Err(RouterError::EmptyStack);
                }
                stack.pop().ok_or(RouterError::EmptyStack)
            })
            .map_err(|_| RouterError::NoActiveScope)?
    }

    /// The top context, or the base context outside any scope.
    pub fn current() -> TenantContext {
        TENANT_STACK
            .try_with(|stack| stack.borrow().last().cloned())
            .ok()
            .flatten()
            .unwrap_or_else(TenantContext::base)
    }

    /// Number of entries on the stack, base included. Zero outside a scope.
    pub fn depth() -> usize {
        TENANT_STACK
            .try_with(|stack| stack.borrow().len())
            .unwrap_or(0)
    }

    /// Push `context` and return a guard that restores the previous depth on drop.
    pub fn enter(context: TenantContext) -> Result<PopGuard> {
        let depth = Self::depth();
        Self::push(context)?;
        Ok(PopGuard { depth })
    }

    /// Run `fut` with `context` on top of the stack.
    ///
    /// The context is popped when `fut` finishes, fails or unwinds.
    pub async fn with_tenant<F: Future>(context: TenantContext, fut: F) -> Result<F::Output> {
        let _guard = Self::enter(context)?;
        Ok(fut.await)
    }

    /// Blocking counterpart of [`ContextStack::with_tenant`].
    pub fn with_tenant_sync<R>(context: TenantContext, f: impl FnOnce() -> R) -> Result<R> {
        let _guard = Self::enter(context)?;
        Ok(f())
    }
}

/// Restores the stack to the depth it had before [`ContextStack::enter`].
#[must_use = "dropping the guard pops the context immediately"]
pub struct PopGuard {
    depth: usize,
}

impl Drop for PopGuard {
    fn drop(&mut self) {
        let depth = self.depth.max(1);
        let _ = TENANT_STACK.try_with(|stack| stack.borrow_mut().truncate(depth));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme() -> TenantContext {
        TenantContext::new("acme.example.com")
    }

    #[tokio::test]
    async fn test_base_outside_scope() {
        assert!(!ContextStack::is_active());
        assert!(ContextStack::current().is_base());
        assert_eq!(ContextStack::depth(), 0);
        assert!(matches!(ContextStack::push(acme()), Err(RouterError::NoActiveScope)));
    }

    #[tokio::test]
    async fn test_push_pop_current() {
        ContextStack::scope(async {
            assert_eq!(ContextStack::depth(), 1);
            ContextStack::push(acme()).unwrap();
            assert_eq!(ContextStack::current(), acme());

            let popped = ContextStack::pop().unwrap();
            assert_eq!(popped, acme());
            assert!(ContextStack::current().is_base());
        })
        .await;
    }

    #[tokio::test]
    async fn test_base_is_never_popped() {
        ContextStack::scope(async {
            assert!(matches!(ContextStack::pop(), Err(RouterError::EmptyStack)));
            assert_eq!(ContextStack::depth(), 1);
        })
        .await;
    }

    #[tokio::test]
    async fn test_empty_context_rejected() {
        ContextStack::scope(async {
            let err = ContextStack::push(TenantContext::new("")).unwrap_err();
            assert!(matches!(err, RouterError::InvalidContext(_)));
        })
        .await;
    }

    #[tokio::test]
    async fn test_concurrent_scopes_are_isolated() {
        let a = tokio::spawn(ContextStack::scope(async {
            ContextStack::push(acme()).unwrap();
            tokio::task::yield_now().await;
            ContextStack::current()
        }));
        let b = tokio::spawn(ContextStack::scope(async {
            tokio::task::yield_now().await;
            ContextStack::current()
        }));

        assert_eq!(a.await.unwrap(), acme());
        assert!(b.await.unwrap().is_base());
    }

    #[tokio::test]
    async fn test_with_tenant_restores_depth_on_error() {
        ContextStack::scope(async {
            let before = ContextStack::depth();
            let result: std::result::Result<(), &str> =
                ContextStack::with_tenant(acme(), async { Err("boom") })
                    .await
                    .unwrap();

            assert!(result.is_err());
            assert_eq!(ContextStack::depth(), before);
        })
        .await;
    }

    #[tokio::test]
    async fn test_guard_pops_unbalanced_pushes() {
        ContextStack::scope(async {
            {
                let _guard = ContextStack::enter(acme()).unwrap();
                ContextStack::push(TenantContext::new("globex.example.com")).unwrap();
                assert_eq!(ContextStack::depth(), 3);
            }
            assert_eq!(ContextStack::depth(), 1);
        })
        .await;
    }

    #[test]
    fn test_sync_scope() {
        let id = ContextStack::sync_scope(|| {
            ContextStack::with_tenant_sync(acme(), || ContextStack::current().id().to_string())
                .unwrap()
        });
        assert_eq!(id, "acme.example.com");
    }
}
