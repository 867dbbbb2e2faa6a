use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use praxis_clock::Clock;
use praxis_types::{EventKind, EventSink, Instant};

use crate::cancel::CancelToken;
use crate::scope::FinalizerScope;

/// Everything an effect evaluation can reach.
///
/// One env is assembled per top-level run; combinators that isolate a child
/// computation (`fork`, `timeout`, `race`, `all`) derive a child env with a
/// child cancel token and a fresh scope. Cloning shares the underlying
/// pieces.
#[derive(Clone)]
pub struct Env {
    pub clock: Arc<dyn Clock>,
    pub cancel: Arc<CancelToken>,
    pub scope: Arc<FinalizerScope>,
    pub sink: EventSink,
    context: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Env {
    /// Root env: fresh token, fresh scope, empty context.
    pub fn new(clock: Arc<dyn Clock>, sink: EventSink) -> Self {
        Self::assemble(clock, sink, CancelToken::root(), Arc::new(FinalizerScope::new()))
    }

    pub fn assemble(
        clock: Arc<dyn Clock>,
        sink: EventSink,
        cancel: Arc<CancelToken>,
        scope: Arc<FinalizerScope>,
    ) -> Self {
        Self {
            clock,
            cancel,
            scope,
            sink,
            context: HashMap::new(),
        }
    }

    /// Same clock/sink/context, different token and scope.
    pub(crate) fn with_token_and_scope(
        &self,
        cancel: Arc<CancelToken>,
        scope: Arc<FinalizerScope>,
    ) -> Env {
        let mut env = self.clone();
        env.cancel = cancel;
        env.scope = scope;
        env
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Emit with `at` taken from this env's clock.
    pub fn emit(&self, kind: EventKind) {
        self.sink.emit_at(self.now(), kind);
    }

    /// Extend the context with a typed value under an opaque string key.
    pub fn with_value<T: Any + Send + Sync>(mut self, key: impl Into<String>, value: T) -> Env {
        self.context.insert(key.into(), Arc::new(value));
        self
    }

    /// Typed context lookup. `None` when the key is absent or the type does
    /// not match.
    pub fn value<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.context
            .get(key)
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("cancel", &self.cancel)
            .field("scope", &self.scope)
            .field("context_keys", &self.context.len())
            .finish()
    }
}
