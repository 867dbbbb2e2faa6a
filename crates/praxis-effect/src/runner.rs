use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use praxis_clock::Clock;
use praxis_types::{EventKind, EventSink, Outcome};

use crate::cancel::CancelToken;
use crate::effect::{Effect, cause_of};
use crate::env::Env;
use crate::scope::FinalizerScope;

/// Entry point for evaluating effects.
///
/// A runner owns the clock and sink every run is wired to. Each run gets a
/// root cancel token (unless one is supplied), a fresh finalizer scope that
/// is closed with the outcome's cause, and a run id stamped on the
/// `effect:start` / `effect:success` / `effect:error` events.
#[derive(Clone)]
pub struct Runner {
    clock: Arc<dyn Clock>,
    sink: EventSink,
    next_run_id: Arc<AtomicU64>,
}

impl Runner {
    pub fn new(clock: Arc<dyn Clock>, sink: EventSink) -> Self {
        Self {
            clock,
            sink,
            next_run_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    pub async fn run<A, E>(&self, effect: Effect<A, E>) -> Outcome<A, E>
    where
        A: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        self.run_with(effect, CancelToken::root()).await
    }

    /// Run under a caller-supplied token, so the whole execution can be
    /// cancelled from outside.
    pub async fn run_with<A, E>(
        &self,
        effect: Effect<A, E>,
        cancel: Arc<CancelToken>,
    ) -> Outcome<A, E>
    where
        A: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let scope = Arc::new(FinalizerScope::new());
        let env = Env::assemble(
            Arc::clone(&self.clock),
            self.sink.clone(),
            cancel,
            Arc::clone(&scope),
        );
        env.emit(EventKind::EffectStart { run_id });
        let outcome = effect.eval(env.clone()).await;
        scope.close(cause_of(&outcome)).await;
        match &outcome {
            Ok(_) => env.emit(EventKind::EffectSuccess { run_id }),
            Err(fault) => env.emit(EventKind::EffectError {
                run_id,
                message: fault.to_string(),
            }),
        }
        outcome
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner").finish()
    }
}
