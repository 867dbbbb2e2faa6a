use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use praxis_types::{EventKind, Fault, Millis, Outcome};

use crate::env::Env;
use crate::scope::{ExitCause, FinalizerScope};

/// A lazy, suspendable computation producing `Outcome<A, E>`.
///
/// An effect is pure data until it is evaluated with an [`Env`]; nothing runs
/// at construction. Evaluation under an already-cancelled token
/// short-circuits to `Err(Fault::Interrupted)` without invoking the wrapped
/// function.
pub struct Effect<A, E> {
    pub(crate) run: Box<dyn FnOnce(Env) -> BoxFuture<'static, Outcome<A, E>> + Send>,
}

/// The scope cause corresponding to an outcome.
pub(crate) fn cause_of<A, E>(outcome: &Outcome<A, E>) -> ExitCause {
    match outcome {
        Ok(_) => ExitCause::Ok,
        Err(Fault::Interrupted) => ExitCause::Interrupted,
        Err(_) => ExitCause::Error,
    }
}

impl<A: Send + 'static, E: Send + 'static> Effect<A, E> {
    pub fn new(
        f: impl FnOnce(Env) -> BoxFuture<'static, Outcome<A, E>> + Send + 'static,
    ) -> Self {
        Self { run: Box::new(f) }
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Env) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome<A, E>> + Send + 'static,
    {
        Self::new(move |env| Box::pin(f(env)))
    }

    pub fn succeed(value: A) -> Self {
        Self::new(move |_env| Box::pin(std::future::ready(Ok(value))))
    }

    pub fn fail(error: E) -> Self {
        Self::new(move |_env| Box::pin(std::future::ready(Err(Fault::User(error)))))
    }

    /// Wrap a fallible async producer; its `Err` becomes `Fault::User`.
    pub fn from_fallible<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<A, E>> + Send + 'static,
    {
        Self::new(move |_env| Box::pin(async move { f().await.map_err(Fault::User) }))
    }

    /// Never completes.
    pub fn never() -> Self {
        Self::new(|_env| Box::pin(futures::future::pending()))
    }

    pub(crate) fn eval(self, env: Env) -> BoxFuture<'static, Outcome<A, E>> {
        if env.cancel.is_cancelled() {
            return Box::pin(std::future::ready(Err(Fault::Interrupted)));
        }
        (self.run)(env)
    }

    pub fn map<B: Send + 'static>(self, f: impl FnOnce(A) -> B + Send + 'static) -> Effect<B, E> {
        Effect::new(move |env| {
            let inner = self.eval(env);
            Box::pin(async move { inner.await.map(f) })
        })
    }

    /// Fallible mapping: an `Err` from `f` becomes a user failure.
    pub fn try_map<B: Send + 'static>(
        self,
        f: impl FnOnce(A) -> Result<B, E> + Send + 'static,
    ) -> Effect<B, E> {
        Effect::new(move |env| {
            let inner = self.eval(env);
            Box::pin(async move {
                let value = inner.await?;
                f(value).map_err(Fault::User)
            })
        })
    }

    pub fn and_then<B: Send + 'static>(
        self,
        f: impl FnOnce(A) -> Effect<B, E> + Send + 'static,
    ) -> Effect<B, E> {
        Effect::new(move |env| {
            Box::pin(async move {
                let value = self.eval(env.clone()).await?;
                f(value).eval(env).await
            })
        })
    }

    /// Replace a failure with the handler's effect. Success passes through.
    pub fn catch(self, handler: impl FnOnce(Fault<E>) -> Effect<A, E> + Send + 'static) -> Self {
        Effect::new(move |env| {
            Box::pin(async move {
                match self.eval(env.clone()).await {
                    Ok(value) => Ok(value),
                    Err(fault) => handler(fault).eval(env).await,
                }
            })
        })
    }

    /// Run `cleanup` if the current token cancels while this effect is in
    /// flight; deregistered on completion.
    pub fn on_interrupt(self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        Effect::new(move |env| {
            Box::pin(async move {
                let listener = env.cancel.on_cancel(cleanup);
                let outcome = self.eval(env.clone()).await;
                listener.unsubscribe();
                outcome
            })
        })
    }

    /// Extend the env context with a typed value under `key`.
    pub fn with_context<T: std::any::Any + Send + Sync>(
        self,
        key: impl Into<String> + Send + 'static,
        value: T,
    ) -> Self {
        Effect::new(move |env| self.eval(env.with_value(key, value)))
    }

    /// Substitute the clock for this effect and everything under it.
    pub fn with_clock(self, clock: Arc<dyn praxis_clock::Clock>) -> Self {
        Effect::new(move |mut env| {
            env.clock = clock;
            self.eval(env)
        })
    }

    /// Bound the effect to `limit` milliseconds of clock time.
    ///
    /// The inner effect runs under a child token and a fresh scope. When the
    /// delay wins, the child is cancelled, its scope closes with
    /// `Interrupted`, and the result is `Err(Fault::Timeout)`.
    pub fn timeout(self, limit: Millis) -> Self {
        Effect::new(move |env| {
            Box::pin(async move {
                env.emit(EventKind::TimeoutStart { limit_ms: limit });
                let child_cancel = env.cancel.child();
                let child_scope = Arc::new(FinalizerScope::new());
                let child_env =
                    env.with_token_and_scope(Arc::clone(&child_cancel), Arc::clone(&child_scope));
                let mut inner = self.eval(child_env);
                let delay = env.clock.sleep(limit);
                tokio::select! {
                    biased;
                    outcome = &mut inner => {
                        child_scope.close(cause_of(&outcome)).await;
                        outcome
                    }
                    _ = env.cancel.cancelled() => {
                        child_cancel.cancel(Some("parent interrupted"));
                        child_scope.close(ExitCause::Interrupted).await;
                        Err(Fault::Interrupted)
                    }
                    _ = delay => {
                        env.emit(EventKind::TimeoutTriggered { limit_ms: limit });
                        child_cancel.cancel(Some("timeout"));
                        child_scope.close(ExitCause::Interrupted).await;
                        Err(Fault::Timeout(limit))
                    }
                }
            })
        })
    }

    /// Run every effect concurrently; succeed with all values in input
    /// order, or fail with the first error after cancelling the rest.
    pub fn all(effects: Vec<Effect<A, E>>) -> Effect<Vec<A>, E> {
        Effect::new(move |env| {
            Box::pin(async move {
                let total = effects.len();
                let mut tokens = Vec::with_capacity(total);
                let mut scopes: Vec<Option<Arc<FinalizerScope>>> = Vec::with_capacity(total);
                let mut running = FuturesUnordered::new();
                for (index, effect) in effects.into_iter().enumerate() {
                    let token = env.cancel.child();
                    let scope = Arc::new(FinalizerScope::new());
                    let child_env =
                        env.with_token_and_scope(Arc::clone(&token), Arc::clone(&scope));
                    tokens.push(token);
                    scopes.push(Some(scope));
                    running.push(async move { (index, effect.eval(child_env).await) });
                }

                let mut slots: Vec<Option<A>> = (0..total).map(|_| None).collect();
                let mut first_error: Option<Fault<E>> = None;
                while let Some((index, outcome)) = running.next().await {
                    if let Some(scope) = scopes[index].take() {
                        scope.close(cause_of(&outcome)).await;
                    }
                    match outcome {
                        Ok(value) => slots[index] = Some(value),
                        Err(fault) => {
                            if first_error.is_none() {
                                first_error = Some(fault);
                                for token in &tokens {
                                    token.cancel(Some("sibling failed"));
                                }
                            }
                        }
                    }
                }

                if let Some(fault) = first_error {
                    return Err(fault);
                }
                let mut values = Vec::with_capacity(total);
                for slot in slots {
                    match slot {
                        Some(value) => values.push(value),
                        None => return Err(Fault::Interrupted),
                    }
                }
                Ok(values)
            })
        })
    }

    /// First effect to settle wins — with its result, `Ok` or `Err`. Losers
    /// are cancelled and their scopes closed with `Interrupted` before the
    /// race returns. An empty race never completes.
    pub fn race(effects: Vec<Effect<A, E>>) -> Effect<A, E> {
        Effect::new(move |env| {
            Box::pin(async move {
                if effects.is_empty() {
                    return futures::future::pending().await;
                }
                let total = effects.len();
                let mut tokens = Vec::with_capacity(total);
                let mut scopes: Vec<Option<Arc<FinalizerScope>>> = Vec::with_capacity(total);
                let mut running = FuturesUnordered::new();
                for (index, effect) in effects.into_iter().enumerate() {
                    let token = env.cancel.child();
                    let scope = Arc::new(FinalizerScope::new());
                    let child_env =
                        env.with_token_and_scope(Arc::clone(&token), Arc::clone(&scope));
                    tokens.push(token);
                    scopes.push(Some(scope));
                    running.push(async move { (index, effect.eval(child_env).await) });
                }

                let mut winner: Option<Outcome<A, E>> = None;
                while let Some((index, outcome)) = running.next().await {
                    let scope = scopes[index].take();
                    if winner.is_none() {
                        if let Some(scope) = scope {
                            scope.close(cause_of(&outcome)).await;
                        }
                        for token in &tokens {
                            token.cancel(Some("race settled"));
                        }
                        winner = Some(outcome);
                    } else if let Some(scope) = scope {
                        scope.close(ExitCause::Interrupted).await;
                    }
                }
                winner.unwrap_or(Err(Fault::Interrupted))
            })
        })
    }

    /// Acquire a resource, use it, and guarantee release with the execution's
    /// exit cause.
    ///
    /// `release` is pushed onto the *current* scope, so it runs when the
    /// enclosing execution closes — with `ok`, `error`, or `interrupted` as
    /// appropriate. An acquire failure returns without running `use_fn` or
    /// `release`.
    pub fn bracket<R>(
        acquire: Effect<R, E>,
        use_fn: impl FnOnce(R) -> Effect<A, E> + Send + 'static,
        release: impl FnOnce(R, ExitCause) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    ) -> Effect<A, E>
    where
        R: Clone + Send + 'static,
    {
        Effect::new(move |env| {
            Box::pin(async move {
                let resource = match acquire.eval(env.clone()).await {
                    Ok(resource) => resource,
                    Err(fault) => return Err(fault),
                };
                let held = resource.clone();
                if env
                    .scope
                    .push(move |cause| release(held, cause))
                    .is_err()
                {
                    tracing::warn!("bracket release dropped: scope already closed");
                }
                use_fn(resource).eval(env).await
            })
        })
    }
}

impl<E: Send + 'static> Effect<(), E> {
    /// Completes after `duration` of clock time, or immediately — still
    /// `Ok` — when the current token cancels first. The interruption itself
    /// is surfaced by whatever combinator caused it.
    pub fn sleep(duration: Millis) -> Self {
        Effect::new(move |env| {
            Box::pin(async move {
                let timer = env.clock.sleep(duration);
                tokio::select! {
                    biased;
                    _ = env.cancel.cancelled() => Ok(()),
                    _ = timer => Ok(()),
                }
            })
        })
    }

    /// Completes once the wall clock reaches `target_wall_ms`.
    ///
    /// Emits `deadline:ok` when completion lands exactly on the target wall
    /// time, `deadline:err` when it overshoots — including a target already
    /// in the past, which completes immediately.
    pub fn deadline(target_wall_ms: i64) -> Self {
        Effect::new(move |env| {
            Box::pin(async move {
                env.emit(EventKind::DeadlineStart { target_wall_ms });
                loop {
                    let now = env.clock.now();
                    if now.wall_ms >= target_wall_ms {
                        let kind = if now.wall_ms <= target_wall_ms {
                            EventKind::DeadlineOk {
                                completed_wall_ms: now.wall_ms,
                            }
                        } else {
                            EventKind::DeadlineErr {
                                completed_wall_ms: now.wall_ms,
                            }
                        };
                        env.sink.emit_at(now, kind);
                        return Ok(());
                    }
                    let timer = env.clock.sleep(Millis::from_signed(target_wall_ms - now.wall_ms));
                    tokio::select! {
                        biased;
                        _ = env.cancel.cancelled() => return Ok(()),
                        _ = timer => {}
                    }
                }
            })
        })
    }
}

impl<A, E> std::fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Effect")
    }
}
