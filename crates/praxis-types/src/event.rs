use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::instant::{Instant, Millis};
use crate::process_id::ProcessId;

/// A single structured runtime event: what happened, and when.
///
/// `at` always comes from the Clock that owns the emitting component, so a
/// controlled clock produces fully deterministic event streams.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub at: Instant,
    pub kind: EventKind,
}

/// Every event the runtime emits, grouped by subsystem.
///
/// Names are stable: `name()` returns the canonical colon-separated tag
/// (`"time:sleep:start"`, `"process:msg:end"`, ...). New fields may be added
/// to variants; tags never change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    // ── Time ──
    /// A sleep was registered with the clock.
    SleepStart { duration_ms: Millis },
    /// A sleep resolved. `actual_ms` is measured on the monotonic track.
    SleepEnd { duration_ms: Millis, actual_ms: i64 },
    /// A deadline wait began.
    DeadlineStart { target_wall_ms: i64 },
    /// The deadline completed at or before its target wall time.
    DeadlineOk { completed_wall_ms: i64 },
    /// The deadline completed late (or was already past at the start).
    DeadlineErr { completed_wall_ms: i64 },
    /// A periodic timer was registered.
    IntervalSet { timer_id: u64, every_ms: Millis },
    /// One tick of a periodic timer.
    IntervalTick { timer_id: u64, tick: u64 },
    /// A periodic timer was cancelled; no further ticks will fire.
    IntervalCancel { timer_id: u64 },
    /// A tick callback panicked. The interval continues.
    IntervalError { timer_id: u64, message: String },
    /// A controlled clock advanced its monotonic track.
    Advance { from_mono_ms: i64, to_mono_ms: i64 },
    /// A controlled clock moved its wall track without touching mono.
    WallJump { from_wall_ms: i64, to_wall_ms: i64 },

    // ── Effect ──
    /// A top-level effect run began.
    EffectStart { run_id: u64 },
    EffectSuccess { run_id: u64 },
    EffectError { run_id: u64, message: String },
    /// A `timeout` combinator armed its delay.
    TimeoutStart { limit_ms: Millis },
    /// The delay won; the inner effect was interrupted.
    TimeoutTriggered { limit_ms: Millis },
    /// Attempt N (1-indexed) of a retried effect is starting.
    RetryAttempt { attempt: u32 },
    /// The delay consumed between attempt N and N+1.
    RetryDelay { attempt: u32, delay_ms: Millis },
    RetrySuccess { attempt: u32 },
    /// All attempts failed; the last error is propagated.
    RetryExhausted { attempts: u32 },

    // ── Process ──
    ProcessStart { pid: ProcessId },
    /// The pump is running and the process accepts messages.
    ProcessReady { pid: ProcessId },
    ProcessStop { pid: ProcessId, reason: String },
    ProcessFail { pid: ProcessId, error: String },
    MsgStart { pid: ProcessId, seq: u64 },
    MsgEnd { pid: ProcessId, seq: u64, duration_ms: Millis },
    MsgError { pid: ProcessId, seq: u64, error: String },
    /// An enqueue hit a full mailbox. `dropped_seq` is set under drop-oldest.
    MailboxFull { pid: ProcessId, dropped_seq: Option<u64> },
    MailboxEnqueue { pid: ProcessId, seq: u64 },

    // ── Supervisor ──
    /// A restart was granted. `attempt` counts within the current window.
    SupervisorRestart { pid: ProcessId, attempt: u32, delay_ms: Millis },
    /// The restart budget is exhausted; the process stays down.
    SupervisorGiveup { pid: ProcessId, restarts: u32 },
}

impl EventKind {
    /// The canonical stable tag for this event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SleepStart { .. } => "time:sleep:start",
            Self::SleepEnd { .. } => "time:sleep:end",
            Self::DeadlineStart { .. } => "time:deadline:start",
            Self::DeadlineOk { .. } => "time:deadline:ok",
            Self::DeadlineErr { .. } => "time:deadline:err",
            Self::IntervalSet { .. } => "time:interval:set",
            Self::IntervalTick { .. } => "time:interval:tick",
            Self::IntervalCancel { .. } => "time:interval:cancel",
            Self::IntervalError { .. } => "time:interval:error",
            Self::Advance { .. } => "time:advance",
            Self::WallJump { .. } => "time:wall_jump",
            Self::EffectStart { .. } => "effect:start",
            Self::EffectSuccess { .. } => "effect:success",
            Self::EffectError { .. } => "effect:error",
            Self::TimeoutStart { .. } => "effect:timeout:start",
            Self::TimeoutTriggered { .. } => "effect:timeout:triggered",
            Self::RetryAttempt { .. } => "effect:retry:attempt",
            Self::RetryDelay { .. } => "effect:retry:delay",
            Self::RetrySuccess { .. } => "effect:retry:success",
            Self::RetryExhausted { .. } => "effect:retry:exhausted",
            Self::ProcessStart { .. } => "process:start",
            Self::ProcessReady { .. } => "process:ready",
            Self::ProcessStop { .. } => "process:stop",
            Self::ProcessFail { .. } => "process:fail",
            Self::MsgStart { .. } => "process:msg:start",
            Self::MsgEnd { .. } => "process:msg:end",
            Self::MsgError { .. } => "process:msg:error",
            Self::MailboxFull { .. } => "process:mailbox:full",
            Self::MailboxEnqueue { .. } => "process:mailbox:enqueue",
            Self::SupervisorRestart { .. } => "supervisor:restart",
            Self::SupervisorGiveup { .. } => "supervisor:giveup",
        }
    }
}

/// Best-effort callback receiving structured events.
///
/// Cloning is cheap. The runtime never calls the sink while holding a lock
/// that user code can reach, and never inspects what it emitted.
#[derive(Clone, Default)]
pub struct EventSink {
    inner: Option<Arc<dyn Fn(Event) + Send + Sync>>,
}

impl EventSink {
    /// A sink that discards everything.
    pub fn noop() -> Self {
        Self { inner: None }
    }

    pub fn new(f: impl Fn(Event) + Send + Sync + 'static) -> Self {
        Self {
            inner: Some(Arc::new(f)),
        }
    }

    pub fn emit(&self, event: Event) {
        if let Some(f) = &self.inner {
            f(event);
        }
    }

    pub fn emit_at(&self, at: Instant, kind: EventKind) {
        self.emit(Event { at, kind });
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("enabled", &self.inner.is_some())
            .finish()
    }
}

/// In-memory event collector for tests and demos.
#[derive(Clone, Debug, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that appends into this log.
    pub fn sink(&self) -> EventSink {
        let events = Arc::clone(&self.events);
        EventSink::new(move |event| {
            events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// All emitted tags, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.kind.name()).collect()
    }

    /// Events whose tag equals `name`, in order.
    pub fn of(&self, name: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.name() == name)
            .collect()
    }

    pub fn count_of(&self, name: &str) -> usize {
        self.of(name).len()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> Instant {
        Instant::new(1_000, 5)
    }

    #[test]
    fn names_are_stable_colon_tags() {
        let kind = EventKind::SleepStart {
            duration_ms: Millis::from_millis(10),
        };
        assert_eq!(kind.name(), "time:sleep:start");

        let kind = EventKind::SupervisorGiveup {
            pid: ProcessId::new(),
            restarts: 3,
        };
        assert_eq!(kind.name(), "supervisor:giveup");
    }

    #[test]
    fn noop_sink_swallows_events() {
        let sink = EventSink::noop();
        sink.emit_at(at(), EventKind::Advance {
            from_mono_ms: 0,
            to_mono_ms: 10,
        });
    }

    #[test]
    fn log_preserves_emission_order() {
        let log = EventLog::new();
        let sink = log.sink();

        sink.emit_at(at(), EventKind::EffectStart { run_id: 1 });
        sink.emit_at(at(), EventKind::EffectSuccess { run_id: 1 });

        similar_asserts::assert_eq!(log.names(), vec!["effect:start", "effect:success"]);
        assert_eq!(log.count_of("effect:start"), 1);
        assert!(log.of("effect:error").is_empty());
    }

    #[test]
    fn events_round_trip_through_json() {
        let event = Event {
            at: at(),
            kind: EventKind::RetryDelay {
                attempt: 2,
                delay_ms: Millis::from_millis(200),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
