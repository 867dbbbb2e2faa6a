use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use praxis_types::{EventSink, Instant, Millis};

/// Periodic timer callback. Invoked once per tick, outside any clock lock,
/// so it may call back into the clock (schedule, cancel, even advance).
pub type IntervalFn = Box<dyn Fn() + Send + Sync>;

/// Errors produced by clock operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    #[error("interval stride must be positive")]
    ZeroInterval,
}

/// The single source of "now".
///
/// Two tracks: `wall_ms` (epoch milliseconds, may jump) and `mono_ms`
/// (non-decreasing, duration-safe). Implementations must guarantee that for
/// two `now()` calls in program order the monotonic track never decreases.
pub trait Clock: Send + Sync {
    /// Current two-track timestamp. Constant-time, never fails.
    fn now(&self) -> Instant;

    /// Resolves after at least `duration` monotonic milliseconds.
    ///
    /// A zero duration resolves immediately: nothing is scheduled and no
    /// events are emitted. Otherwise emits `time:sleep:start` on
    /// registration and `time:sleep:end` (with the measured `actual_ms`)
    /// on completion.
    fn sleep(&self, duration: Millis) -> BoxFuture<'static, ()>;

    /// Alias for [`Clock::sleep`].
    fn timeout(&self, duration: Millis) -> BoxFuture<'static, ()> {
        self.sleep(duration)
    }

    /// Invoke `tick` every `every` milliseconds with a fixed stride: the
    /// next fire time advances by `every` regardless of how long the
    /// callback ran. Rejects a zero stride.
    fn interval(&self, every: Millis, tick: IntervalFn) -> Result<TimerHandle, ClockError>;

    /// The sink this clock reports timer events to.
    fn sink(&self) -> &EventSink;
}

/// Handle to a registered interval.
///
/// Cancellation is idempotent and immediate: once `cancel` returns, no
/// further tick runs, including the case where cancel is called from inside
/// the tick callback itself.
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
    on_cancel: Arc<dyn Fn() + Send + Sync>,
}

impl TimerHandle {
    pub(crate) fn new(
        id: u64,
        cancelled: Arc<AtomicBool>,
        on_cancel: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            id,
            cancelled,
            on_cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            (self.on_cancel)();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
