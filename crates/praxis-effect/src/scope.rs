use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::BoxFuture;
use praxis_types::panic_message;

/// Why a scope is closing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitCause {
    Ok,
    Error,
    Interrupted,
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error => write!(f, "error"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("finalizer scope already closed")]
pub struct ScopeClosed;

type Finalizer = Box<dyn FnOnce(ExitCause) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Ordered release actions run when an effect execution ends.
///
/// Finalizers run in LIFO order, each to completion before the next starts.
/// Failures and panics are swallowed: they never mask the effect's result
/// and never stop the remaining finalizers. A scope closes exactly once.
#[derive(Default)]
pub struct FinalizerScope {
    state: Mutex<ScopeState>,
}

#[derive(Default)]
struct ScopeState {
    closed: bool,
    finalizers: Vec<Finalizer>,
}

impl FinalizerScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release action. Fails on a closed scope.
    pub fn push(
        &self,
        finalizer: impl FnOnce(ExitCause) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    ) -> Result<(), ScopeClosed> {
        let mut state = self.lock();
        if state.closed {
            return Err(ScopeClosed);
        }
        state.finalizers.push(Box::new(finalizer));
        Ok(())
    }

    /// Register a synchronous release action.
    pub fn push_fn(
        &self,
        finalizer: impl FnOnce(ExitCause) + Send + 'static,
    ) -> Result<(), ScopeClosed> {
        self.push(move |cause| {
            Box::pin(async move {
                finalizer(cause);
                Ok(())
            })
        })
    }

    /// Run all finalizers in LIFO order. Idempotent.
    pub async fn close(&self, cause: ExitCause) {
        let finalizers = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.finalizers)
        };
        for finalizer in finalizers.into_iter().rev() {
            match AssertUnwindSafe(finalizer(cause)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(%cause, error = %error, "finalizer failed");
                }
                Err(payload) => {
                    tracing::warn!(
                        %cause,
                        message = %panic_message(&*payload),
                        "finalizer panicked"
                    );
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Finalizers registered and not yet run.
    pub fn pending(&self) -> usize {
        self.lock().finalizers.len()
    }

    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for FinalizerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("FinalizerScope")
            .field("closed", &state.closed)
            .field("pending", &state.finalizers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn finalizers_run_lifo_with_the_cause() {
        let scope = FinalizerScope::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let seen = Arc::clone(&order);
            scope
                .push_fn(move |cause| seen.lock().unwrap().push((label, cause)))
                .unwrap();
        }

        scope.close(ExitCause::Error).await;

        assert_eq!(
            *order.lock().unwrap(),
            vec![
                ("third", ExitCause::Error),
                ("second", ExitCause::Error),
                ("first", ExitCause::Error),
            ]
        );
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let scope = FinalizerScope::new();
        let count = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&count);
        scope.push_fn(move |_| *seen.lock().unwrap() += 1).unwrap();

        scope.close(ExitCause::Ok).await;
        scope.close(ExitCause::Ok).await;

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(scope.is_closed());
    }

    #[tokio::test]
    async fn push_on_closed_scope_fails() {
        let scope = FinalizerScope::new();
        scope.close(ExitCause::Ok).await;
        assert_eq!(scope.push_fn(|_| {}), Err(ScopeClosed));
    }

    #[tokio::test]
    async fn failing_and_panicking_finalizers_do_not_stop_the_rest() {
        let scope = FinalizerScope::new();
        let ran = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&ran);
        scope
            .push_fn(move |_| seen.lock().unwrap().push("innermost"))
            .unwrap();
        scope
            .push(|_| Box::pin(async { Err(anyhow::anyhow!("release failed")) }))
            .unwrap();
        scope.push_fn(|_| panic!("release panicked")).unwrap();
        let seen = Arc::clone(&ran);
        scope
            .push_fn(move |_| seen.lock().unwrap().push("outermost"))
            .unwrap();

        scope.close(ExitCause::Ok).await;

        assert_eq!(*ran.lock().unwrap(), vec!["outermost", "innermost"]);
    }

    #[tokio::test]
    async fn async_finalizers_run_to_completion_in_order() {
        let scope = FinalizerScope::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&order);
        scope
            .push(move |_| {
                Box::pin(async move {
                    tokio::task::yield_now().await;
                    seen.lock().unwrap().push("slow");
                    Ok(())
                })
            })
            .unwrap();
        let seen = Arc::clone(&order);
        scope
            .push_fn(move |_| seen.lock().unwrap().push("fast"))
            .unwrap();

        scope.close(ExitCause::Interrupted).await;

        // LIFO: the fast (last-pushed) finalizer completes before the slow
        // one even starts.
        assert_eq!(*order.lock().unwrap(), vec!["fast", "slow"]);
    }
}
