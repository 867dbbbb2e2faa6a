use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::future::BoxFuture;
use praxis_types::{EventKind, EventSink, Instant, Millis, panic_message};
use tokio::sync::Notify;

use crate::clock::{Clock, ClockError, IntervalFn, TimerHandle};

/// Real wall and monotonic time, real timers.
///
/// The monotonic track is measured from construction so values start near
/// zero. Intervals run on a detached tokio task that is woken early when the
/// handle is cancelled.
#[derive(Clone)]
pub struct SystemClock {
    origin: std::time::Instant,
    sink: EventSink,
    next_timer_id: Arc<AtomicU64>,
}

impl SystemClock {
    pub fn new(sink: EventSink) -> Self {
        Self {
            origin: std::time::Instant::now(),
            sink,
            next_timer_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn mono_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }
}

impl std::fmt::Debug for SystemClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemClock")
            .field("mono_ms", &self.mono_ms())
            .finish()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::new(chrono::Utc::now().timestamp_millis(), self.mono_ms())
    }

    fn sleep(&self, duration: Millis) -> BoxFuture<'static, ()> {
        if duration.is_zero() {
            return Box::pin(std::future::ready(()));
        }
        let clock = self.clone();
        Box::pin(async move {
            let start = clock.now();
            clock.sink.emit_at(
                start,
                EventKind::SleepStart {
                    duration_ms: duration,
                },
            );
            tokio::time::sleep(duration.to_duration()).await;
            let end = clock.now();
            clock.sink.emit_at(
                end,
                EventKind::SleepEnd {
                    duration_ms: duration,
                    actual_ms: end.mono_ms - start.mono_ms,
                },
            );
        })
    }

    fn interval(&self, every: Millis, tick: IntervalFn) -> Result<TimerHandle, ClockError> {
        if every.is_zero() {
            return Err(ClockError::ZeroInterval);
        }
        let id = self.next_timer_id.fetch_add(1, Ordering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let callback: Arc<dyn Fn() + Send + Sync> = Arc::from(tick);

        self.sink.emit_at(
            self.now(),
            EventKind::IntervalSet {
                timer_id: id,
                every_ms: every,
            },
        );

        let clock = self.clone();
        let flag = Arc::clone(&cancelled);
        let task_wake = Arc::clone(&wake);
        tokio::spawn(async move {
            let mut next = clock.mono_ms() + every.as_i64();
            let mut tick_count: u64 = 0;
            loop {
                let wait = Millis::from_signed(next - clock.mono_ms());
                tokio::select! {
                    _ = tokio::time::sleep(wait.to_duration()) => {}
                    _ = task_wake.notified() => {}
                }
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                if clock.mono_ms() < next {
                    // Woken early without being cancelled; keep waiting.
                    continue;
                }
                tick_count += 1;
                clock.sink.emit_at(
                    clock.now(),
                    EventKind::IntervalTick {
                        timer_id: id,
                        tick: tick_count,
                    },
                );
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback())) {
                    clock.sink.emit_at(
                        clock.now(),
                        EventKind::IntervalError {
                            timer_id: id,
                            message: panic_message(&*payload),
                        },
                    );
                    tracing::warn!(timer_id = id, "interval callback panicked");
                }
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                next += every.as_i64();
            }
        });

        let on_cancel = {
            let clock = self.clone();
            move || {
                clock
                    .sink
                    .emit_at(clock.now(), EventKind::IntervalCancel { timer_id: id });
                wake.notify_waiters();
            }
        };
        Ok(TimerHandle::new(id, cancelled, Arc::new(on_cancel)))
    }

    fn sink(&self) -> &EventSink {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use praxis_types::EventLog;

    use super::*;

    #[test]
    fn now_is_monotonic() {
        let clock = SystemClock::new(EventSink::noop());
        let mut last = clock.now();
        for _ in 0..100 {
            let next = clock.now();
            assert!(next.mono_ms >= last.mono_ms);
            last = next;
        }
    }

    #[tokio::test]
    async fn zero_sleep_resolves_immediately_without_events() {
        let log = EventLog::new();
        let clock = SystemClock::new(log.sink());
        clock.sleep(Millis::ZERO).await;
        assert!(log.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_emits_start_and_end() {
        let log = EventLog::new();
        let clock = SystemClock::new(log.sink());
        clock.sleep(Millis::from_millis(50)).await;
        assert_eq!(log.names(), vec!["time:sleep:start", "time:sleep:end"]);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let clock = SystemClock::new(EventSink::noop());
        let err = clock.interval(Millis::ZERO, Box::new(|| {})).unwrap_err();
        assert_eq!(err, ClockError::ZeroInterval);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_ticks_and_stops_on_cancel() {
        let log = EventLog::new();
        let clock = SystemClock::new(log.sink());
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handle = clock
            .interval(
                Millis::from_millis(10),
                Box::new(move || {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(35)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);

        handle.cancel();
        let after_cancel = count.load(Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
        assert_eq!(log.count_of("time:interval:cancel"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let log = EventLog::new();
        let clock = SystemClock::new(log.sink());
        let handle = clock
            .interval(Millis::from_millis(10), Box::new(|| {}))
            .unwrap();
        handle.cancel();
        handle.cancel();
        assert_eq!(log.count_of("time:interval:cancel"), 1);
    }
}
