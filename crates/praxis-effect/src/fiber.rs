use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use praxis_types::{Fault, Outcome};
use tokio::sync::Notify;

use crate::cancel::CancelToken;
use crate::effect::{Effect, cause_of};
use crate::env::Env;
use crate::scope::FinalizerScope;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// How long `interrupt` waits for a fiber to observe its cancellation.
/// Fibers suspend only at cancel-aware points, so settlement is normally
/// immediate; the grace guards against a non-cooperative body.
const INTERRUPT_GRACE: Duration = Duration::from_millis(100);

/// Handle to a forked effect.
///
/// The fiber stays observable after completion: `join` and `poll` are
/// idempotent and return the stored result.
pub struct Fiber<A, E> {
    id: u64,
    cancel: Arc<CancelToken>,
    state: Arc<FiberState<A, E>>,
}

struct FiberState<A, E> {
    done: Mutex<Option<Outcome<A, E>>>,
    notify: Notify,
}

impl<A, E> FiberState<A, E> {
    fn new() -> Self {
        Self {
            done: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    fn complete(&self, outcome: Outcome<A, E>) {
        *self.done.lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome);
        self.notify.notify_waiters();
    }

    fn snapshot(&self) -> Option<Outcome<A, E>>
    where
        A: Clone,
        E: Clone,
    {
        self.done.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Resolves once the fiber has completed, result or not observed.
    async fn settled(&self) {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if self
                .done
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some()
            {
                return;
            }
            notified.await;
        }
    }

    async fn wait(&self) -> Outcome<A, E>
    where
        A: Clone,
        E: Clone,
    {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if let Some(outcome) = self.snapshot() {
                return outcome;
            }
            notified.await;
        }
    }
}

impl<A: Send + 'static, E: Send + 'static> Effect<A, E> {
    /// Start this effect on its own task and yield a handle to it.
    ///
    /// The fiber runs under a child token and a fresh scope. A finalizer on
    /// the parent scope cancels the fiber when the parent execution ends, so
    /// leaving scope cannot leak it.
    pub fn fork(self) -> Effect<Fiber<A, E>, E> {
        Effect::new(move |env| {
            Box::pin(async move {
                let fiber = Fiber::spawn(self, &env);
                let token = Arc::clone(&fiber.cancel);
                if env
                    .scope
                    .push_fn(move |_cause| token.cancel(Some("parent scope closed")))
                    .is_err()
                {
                    // Scope already closed; the fiber still runs detached.
                    tracing::debug!(fiber = fiber.id, "forked under a closed scope");
                }
                Ok(fiber)
            })
        })
    }
}

impl<A: Send + 'static, E: Send + 'static> Fiber<A, E> {
    pub(crate) fn spawn(effect: Effect<A, E>, env: &Env) -> Self {
        let cancel = env.cancel.child();
        let scope = Arc::new(FinalizerScope::new());
        let child_env = env.with_token_and_scope(Arc::clone(&cancel), Arc::clone(&scope));
        let state = Arc::new(FiberState::new());

        let task_state = Arc::clone(&state);
        tokio::spawn(async move {
            let outcome = effect.eval(child_env).await;
            scope.close(cause_of(&outcome)).await;
            task_state.complete(outcome);
        });

        Self {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            cancel,
            state,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel_token(&self) -> Arc<CancelToken> {
        Arc::clone(&self.cancel)
    }

    /// Await the fiber's result. Idempotent; interruptible by the caller's
    /// own token.
    pub fn join(&self) -> Effect<A, E>
    where
        A: Clone,
        E: Clone,
    {
        let state = Arc::clone(&self.state);
        Effect::new(move |env| {
            Box::pin(async move {
                tokio::select! {
                    biased;
                    outcome = state.wait() => outcome,
                    _ = env.cancel.cancelled() => Err(Fault::Interrupted),
                }
            })
        })
    }

    /// `Some(result)` if the fiber has completed, else `None`.
    pub fn poll(&self) -> Effect<Option<Outcome<A, E>>, E>
    where
        A: Clone,
        E: Clone,
    {
        let state = Arc::clone(&self.state);
        Effect::new(move |_env| Box::pin(async move { Ok(state.snapshot()) }))
    }

    /// Cancel the fiber and await its termination under a bounded grace.
    pub fn interrupt(&self) -> Effect<(), E> {
        let cancel = Arc::clone(&self.cancel);
        let state = Arc::clone(&self.state);
        Effect::new(move |_env| {
            Box::pin(async move {
                cancel.cancel(Some("interrupted"));
                let _ = tokio::time::timeout(INTERRUPT_GRACE, state.settled()).await;
                Ok(())
            })
        })
    }
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cancel: Arc::clone(&self.cancel),
            state: Arc::clone(&self.state),
        }
    }
}

impl<A, E> std::fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
