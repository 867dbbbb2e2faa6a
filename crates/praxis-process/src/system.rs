use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use praxis_clock::Clock;
use praxis_effect::Runner;
use praxis_types::{EventKind, EventSink, ProcessId};

use crate::mailbox::{Mailbox, OverflowPolicy};
use crate::process::{self, Actor, ProcessRef, ProcessStatus, Shared, StopReason};

/// Per-process spawn configuration.
#[derive(Clone, Copy, Debug)]
pub struct SpawnOptions {
    mailbox_capacity: usize,
    overflow: OverflowPolicy,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            overflow: OverflowPolicy::Reject,
        }
    }
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }
}

/// Type-erased registry entry for a spawned process.
trait ProcessEntry: Send + Sync {
    fn status(&self) -> ProcessStatus;
    fn request_stop(&self);
}

impl<M: Send + 'static> ProcessEntry for ProcessRef<M> {
    fn status(&self) -> ProcessStatus {
        ProcessRef::status(self)
    }

    fn request_stop(&self) {
        self.shared().request_stop(StopReason::Normal);
    }
}

/// Spawn root: wires one Clock and one event sink into every process and
/// effect run, and keeps a registry of everything it spawned.
#[derive(Clone)]
pub struct System {
    inner: Arc<SystemInner>,
}

struct SystemInner {
    clock: Arc<dyn Clock>,
    sink: EventSink,
    registry: Mutex<HashMap<ProcessId, Box<dyn ProcessEntry>>>,
}

impl System {
    pub fn new(clock: Arc<dyn Clock>, sink: EventSink) -> Self {
        Self {
            inner: Arc::new(SystemInner {
                clock,
                sink,
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    pub fn sink(&self) -> &EventSink {
        &self.inner.sink
    }

    /// An effect runner wired to this system's clock and sink.
    pub fn runner(&self) -> Runner {
        Runner::new(self.clock(), self.inner.sink.clone())
    }

    /// Spawn an actor and return the external capability to it.
    pub fn spawn<A: Actor>(&self, actor: A, options: SpawnOptions) -> ProcessRef<A::Msg> {
        let pid = ProcessId::new();
        let mailbox = Mailbox::new(options.mailbox_capacity, options.overflow);
        let shared = Arc::new(Shared::new(
            pid,
            self.clock(),
            self.inner.sink.clone(),
            mailbox,
        ));
        let proc_ref = ProcessRef::new(Arc::clone(&shared));

        self.inner
            .sink
            .emit_at(self.inner.clock.now(), EventKind::ProcessStart { pid });
        self.registry()
            .insert(pid, Box::new(proc_ref.clone()));

        process::start(actor, shared, self.clone());
        proc_ref
    }

    pub fn status_of(&self, pid: ProcessId) -> Option<ProcessStatus> {
        self.registry().get(&pid).map(|entry| entry.status())
    }

    pub fn process_count(&self) -> usize {
        self.registry().len()
    }

    /// Request a cooperative stop on every spawned process and wait for all
    /// of them to settle.
    pub async fn stop_all(&self) {
        {
            let registry = self.registry();
            for entry in registry.values() {
                entry.request_stop();
            }
        }
        loop {
            let all_settled = self
                .registry()
                .values()
                .all(|entry| entry.status().is_terminal());
            if all_settled {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ProcessId, Box<dyn ProcessEntry>>> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("processes", &self.process_count())
            .finish()
    }
}
