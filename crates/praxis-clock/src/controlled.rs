use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use praxis_types::{EventKind, EventSink, Instant, Millis, panic_message};
use tokio::sync::oneshot;

use crate::clock::{Clock, ClockError, IntervalFn, TimerHandle};

/// How many scheduler yields `flush` performs. On the current-thread test
/// runtime this drains every continuation made ready by an advance.
const FLUSH_ROUNDS: usize = 16;

/// Deterministic timer wheel over virtual time.
///
/// Time moves only when a test calls `advance_by`/`advance_to`/`tick`. The
/// drain fires pending timers in strict `(fire_at, registration id)` order,
/// moving both tracks by the same delta per step, and invokes callbacks
/// outside the internal lock so they can schedule, cancel, or advance
/// re-entrantly. The monotonic track never rewinds.
#[derive(Clone)]
pub struct ControlledClock {
    inner: Arc<Mutex<Wheel>>,
    sink: EventSink,
}

struct Wheel {
    wall_ms: i64,
    mono_ms: i64,
    next_timer_id: u64,
    timers: Vec<TimerEntry>,
}

struct TimerEntry {
    id: u64,
    fire_at: i64,
    kind: TimerKind,
}

enum TimerKind {
    Sleep {
        waker: oneshot::Sender<()>,
        duration: Millis,
        start_mono: i64,
    },
    Interval {
        every: Millis,
        tick_count: u64,
        cancelled: Arc<AtomicBool>,
        callback: Arc<dyn Fn() + Send + Sync>,
    },
}

impl TimerEntry {
    /// A dead timer never fires: a cancelled interval, or a sleep whose
    /// future was dropped.
    fn is_dead(&self) -> bool {
        match &self.kind {
            TimerKind::Sleep { waker, .. } => waker.is_closed(),
            TimerKind::Interval { cancelled, .. } => cancelled.load(Ordering::SeqCst),
        }
    }
}

enum Fired {
    Sleep {
        waker: oneshot::Sender<()>,
        duration: Millis,
        actual_ms: i64,
        at: Instant,
    },
    Tick {
        timer_id: u64,
        tick: u64,
        callback: Arc<dyn Fn() + Send + Sync>,
        at: Instant,
    },
}

impl ControlledClock {
    /// Both tracks start at zero.
    pub fn new(sink: EventSink) -> Self {
        Self::with_wall(0, sink)
    }

    /// Monotonic track starts at zero, wall track at `wall_ms`.
    pub fn with_wall(wall_ms: i64, sink: EventSink) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Wheel {
                wall_ms,
                mono_ms: 0,
                next_timer_id: 1,
                timers: Vec::new(),
            })),
            sink,
        }
    }

    fn wheel(&self) -> MutexGuard<'_, Wheel> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advance the monotonic track by `delta`, draining due timers.
    ///
    /// `advance_by(Millis::ZERO)` is a complete no-op: no events, no fires.
    pub fn advance_by(&self, delta: Millis) {
        if delta.is_zero() {
            return;
        }
        let target = self.wheel().mono_ms + delta.as_i64();
        self.drain_to(target);
    }

    /// Advance the monotonic track to an absolute target. Targets at or
    /// before the current mono time are a no-op.
    pub fn advance_to(&self, target_mono_ms: i64) {
        self.drain_to(target_mono_ms);
    }

    /// Advance to the next pending timer. No-op when nothing is pending.
    pub fn tick(&self) {
        let next = self
            .wheel()
            .timers
            .iter()
            .filter(|t| !t.is_dead())
            .map(|t| t.fire_at)
            .min();
        if let Some(fire_at) = next {
            self.drain_to(fire_at);
        }
    }

    /// Move the wall track to `wall_ms` — forward or back — without touching
    /// the monotonic track or any timer.
    pub fn jump_wall_time(&self, wall_ms: i64) {
        let (at, from) = {
            let mut wheel = self.wheel();
            let from = wheel.wall_ms;
            wheel.wall_ms = wall_ms;
            (Instant::new(wheel.wall_ms, wheel.mono_ms), from)
        };
        self.sink.emit_at(
            at,
            EventKind::WallJump {
                from_wall_ms: from,
                to_wall_ms: wall_ms,
            },
        );
    }

    /// Live (non-cancelled, non-abandoned) timers still scheduled.
    pub fn pending_timer_count(&self) -> usize {
        self.wheel().timers.iter().filter(|t| !t.is_dead()).count()
    }

    /// Yield to the scheduler until continuations unblocked by a previous
    /// advance have run.
    pub async fn flush(&self) {
        for _ in 0..FLUSH_ROUNDS {
            tokio::task::yield_now().await;
        }
    }

    fn drain_to(&self, target: i64) {
        let from = self.wheel().mono_ms;
        if target <= from {
            return;
        }
        loop {
            let fired = self.fire_next(target);
            match fired {
                None => break,
                Some(Fired::Sleep {
                    waker,
                    duration,
                    actual_ms,
                    at,
                }) => {
                    self.sink.emit_at(
                        at,
                        EventKind::SleepEnd {
                            duration_ms: duration,
                            actual_ms,
                        },
                    );
                    // Receiver may be gone; the entry was live when selected.
                    let _ = waker.send(());
                }
                Some(Fired::Tick {
                    timer_id,
                    tick,
                    callback,
                    at,
                }) => {
                    self.sink
                        .emit_at(at, EventKind::IntervalTick { timer_id, tick });
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback())) {
                        self.sink.emit_at(
                            self.now(),
                            EventKind::IntervalError {
                                timer_id,
                                message: panic_message(&*payload),
                            },
                        );
                        tracing::warn!(timer_id, "interval callback panicked");
                    }
                }
            }
        }
        let to = {
            let mut wheel = self.wheel();
            if wheel.mono_ms < target {
                wheel.wall_ms += target - wheel.mono_ms;
                wheel.mono_ms = target;
            }
            wheel.mono_ms
        };
        self.sink.emit_at(
            self.now(),
            EventKind::Advance {
                from_mono_ms: from,
                to_mono_ms: to,
            },
        );
    }

    /// Select and consume the earliest live timer due at or before `target`.
    ///
    /// Both tracks advance by the same delta to the timer's fire time. The
    /// mono time is read fresh on every call, so a callback that advanced
    /// the clock re-entrantly is observed, and the delta clamps at zero —
    /// time never rewinds for a timer registered in the past.
    fn fire_next(&self, target: i64) -> Option<Fired> {
        let mut wheel = self.wheel();
        wheel.timers.retain(|t| !t.is_dead());
        let idx = wheel
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.fire_at <= target)
            .min_by_key(|(_, t)| (t.fire_at, t.id))
            .map(|(i, _)| i)?;

        let delta = (wheel.timers[idx].fire_at - wheel.mono_ms).max(0);
        wheel.mono_ms += delta;
        wheel.wall_ms += delta;
        let at = Instant::new(wheel.wall_ms, wheel.mono_ms);

        if matches!(wheel.timers[idx].kind, TimerKind::Sleep { .. }) {
            let entry = wheel.timers.swap_remove(idx);
            match entry.kind {
                TimerKind::Sleep {
                    waker,
                    duration,
                    start_mono,
                } => Some(Fired::Sleep {
                    waker,
                    duration,
                    actual_ms: at.mono_ms - start_mono,
                    at,
                }),
                TimerKind::Interval { .. } => None,
            }
        } else {
            let TimerEntry { id, fire_at, kind } = &mut wheel.timers[idx];
            match kind {
                TimerKind::Interval {
                    every,
                    tick_count,
                    callback,
                    ..
                } => {
                    *fire_at += every.as_i64();
                    *tick_count += 1;
                    Some(Fired::Tick {
                        timer_id: *id,
                        tick: *tick_count,
                        callback: Arc::clone(callback),
                        at,
                    })
                }
                TimerKind::Sleep { .. } => None,
            }
        }
    }
}

impl std::fmt::Debug for ControlledClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let wheel = self.wheel();
        f.debug_struct("ControlledClock")
            .field("wall_ms", &wheel.wall_ms)
            .field("mono_ms", &wheel.mono_ms)
            .field("timers", &wheel.timers.len())
            .finish()
    }
}

impl Clock for ControlledClock {
    fn now(&self) -> Instant {
        let wheel = self.wheel();
        Instant::new(wheel.wall_ms, wheel.mono_ms)
    }

    fn sleep(&self, duration: Millis) -> BoxFuture<'static, ()> {
        if duration.is_zero() {
            return Box::pin(std::future::ready(()));
        }
        let (tx, rx) = oneshot::channel();
        let start = {
            let mut wheel = self.wheel();
            let id = wheel.next_timer_id;
            wheel.next_timer_id += 1;
            let mono_ms = wheel.mono_ms;
            let fire_at = mono_ms + duration.as_i64();
            wheel.timers.push(TimerEntry {
                id,
                fire_at,
                kind: TimerKind::Sleep {
                    waker: tx,
                    duration,
                    start_mono: mono_ms,
                },
            });
            Instant::new(wheel.wall_ms, wheel.mono_ms)
        };
        self.sink.emit_at(
            start,
            EventKind::SleepStart {
                duration_ms: duration,
            },
        );
        Box::pin(async move {
            // The wheel emits sleep:end at fire time; resolution here only
            // wakes the awaiting task.
            let _ = rx.await;
        })
    }

    fn interval(&self, every: Millis, tick: IntervalFn) -> Result<TimerHandle, ClockError> {
        if every.is_zero() {
            return Err(ClockError::ZeroInterval);
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let callback: Arc<dyn Fn() + Send + Sync> = Arc::from(tick);
        let (id, at) = {
            let mut wheel = self.wheel();
            let id = wheel.next_timer_id;
            wheel.next_timer_id += 1;
            let fire_at = wheel.mono_ms + every.as_i64();
            wheel.timers.push(TimerEntry {
                id,
                fire_at,
                kind: TimerKind::Interval {
                    every,
                    tick_count: 0,
                    cancelled: Arc::clone(&cancelled),
                    callback: Arc::clone(&callback),
                },
            });
            (id, Instant::new(wheel.wall_ms, wheel.mono_ms))
        };
        self.sink.emit_at(
            at,
            EventKind::IntervalSet {
                timer_id: id,
                every_ms: every,
            },
        );
        let on_cancel = {
            let clock = self.clone();
            move || {
                clock
                    .sink
                    .emit_at(clock.now(), EventKind::IntervalCancel { timer_id: id });
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

    fn clock_and_log() -> (ControlledClock, EventLog) {
        let log = EventLog::new();
        (ControlledClock::new(log.sink()), log)
    }

    #[test_log::test(tokio::test)]
    async fn day_long_simulation_resolves_all_sleeps() {
        let (clock, _log) = clock_and_log();
        let durations = [1_000_u64, 3_600_000, 43_200_000, 86_400_000];
        let handles: Vec<_> = durations
            .iter()
            .map(|&ms| tokio::spawn(clock.sleep(Millis::from_millis(ms))))
            .collect();

        clock.flush().await;
        clock.advance_by(Millis::from_millis(86_400_000));
        clock.flush().await;

        for handle in handles {
            assert!(handle.is_finished());
            handle.await.unwrap();
        }
        assert_eq!(clock.now().mono_ms, 86_400_000);
    }

    #[test]
    fn advance_by_zero_is_a_complete_noop() {
        let (clock, log) = clock_and_log();
        clock.advance_by(Millis::ZERO);
        assert!(log.events().is_empty());
        assert_eq!(clock.now(), Instant::new(0, 0));
    }

    #[tokio::test]
    async fn advance_moves_mono_exactly_and_fires_due_timers_once() {
        let (clock, log) = clock_and_log();
        let sleep = tokio::spawn(clock.sleep(Millis::from_millis(30)));
        clock.flush().await;

        clock.advance_by(Millis::from_millis(100));
        clock.flush().await;

        assert_eq!(clock.now().mono_ms, 100);
        assert!(sleep.is_finished());
        assert_eq!(log.count_of("time:sleep:end"), 1);

        let end = &log.of("time:sleep:end")[0];
        assert_eq!(end.at.mono_ms, 30);
        match &end.kind {
            EventKind::SleepEnd { actual_ms, .. } => assert_eq!(*actual_ms, 30),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn interval_ticks_at_fixed_stride() {
        let (clock, log) = clock_and_log();
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&ticks);
        let observer = clock.clone();
        clock
            .interval(
                Millis::from_millis(100),
                Box::new(move || {
                    seen.lock().unwrap().push(observer.now().mono_ms);
                }),
            )
            .unwrap();

        clock.advance_by(Millis::from_millis(350));

        similar_asserts::assert_eq!(*ticks.lock().unwrap(), vec![100, 200, 300]);
        assert_eq!(log.count_of("time:interval:tick"), 3);
    }

    #[test]
    fn interval_cadence_survives_reentrant_advance() {
        let (clock, _log) = clock_and_log();
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&ticks);
        let reentrant = clock.clone();
        clock
            .interval(
                Millis::from_millis(100),
                Box::new(move || {
                    seen.lock().unwrap().push(reentrant.now().mono_ms);
                    reentrant.advance_by(Millis::from_millis(10));
                }),
            )
            .unwrap();

        clock.advance_by(Millis::from_millis(350));

        // Ticks land on the stride grid even though each callback itself
        // advanced the clock by 10ms.
        assert_eq!(*ticks.lock().unwrap(), vec![100, 200, 300]);
        assert_eq!(clock.now().mono_ms, 350);
    }

    #[test]
    fn simultaneous_timers_fire_in_registration_order() {
        let (clock, _log) = clock_and_log();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let seen = Arc::clone(&order);
            clock
                .interval(
                    Millis::from_millis(50),
                    Box::new(move || {
                        seen.lock().unwrap().push(label);
                    }),
                )
                .unwrap();
        }

        clock.advance_by(Millis::from_millis(50));

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn cancel_inside_callback_prevents_the_next_tick() {
        let (clock, log) = clock_and_log();
        let count = Arc::new(AtomicUsize::new(0));
        let handle_cell: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));

        let seen = Arc::clone(&count);
        let cell = Arc::clone(&handle_cell);
        let handle = clock
            .interval(
                Millis::from_millis(10),
                Box::new(move || {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if let Some(h) = cell.lock().unwrap().as_ref() {
                        h.cancel();
                    }
                }),
            )
            .unwrap();
        *handle_cell.lock().unwrap() = Some(handle);

        clock.advance_by(Millis::from_millis(100));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(log.count_of("time:interval:cancel"), 1);
        assert_eq!(clock.pending_timer_count(), 0);
    }

    #[test]
    fn callback_panic_is_captured_and_the_interval_continues() {
        let (clock, log) = clock_and_log();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        clock
            .interval(
                Millis::from_millis(10),
                Box::new(move || {
                    if seen.fetch_add(1, Ordering::SeqCst) == 1 {
                        panic!("tick two exploded");
                    }
                }),
            )
            .unwrap();

        clock.advance_by(Millis::from_millis(30));

        assert_eq!(count.load(Ordering::SeqCst), 3);
        let errors = log.of("time:interval:error");
        assert_eq!(errors.len(), 1);
        match &errors[0].kind {
            EventKind::IntervalError { message, .. } => {
                assert_eq!(message, "tick two exploded");
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn zero_interval_is_rejected() {
        let (clock, _log) = clock_and_log();
        let err = clock.interval(Millis::ZERO, Box::new(|| {})).unwrap_err();
        assert_eq!(err, ClockError::ZeroInterval);
    }

    #[test]
    fn wall_jump_moves_wall_only_and_durations_use_mono() {
        let start_wall = 1_700_000_000_000;
        let log = EventLog::new();
        let clock = ControlledClock::with_wall(start_wall, log.sink());
        let start = clock.now();

        clock.advance_by(Millis::from_millis(7_200_000));
        clock.jump_wall_time(start_wall - 3_600_000);

        let end = clock.now();
        assert_eq!(end.mono_since(&start), Millis::from_millis(7_200_000));
        assert_eq!(end.wall_since(&start), -3_600_000);
        assert_eq!(log.count_of("time:wall_jump"), 1);
    }

    #[tokio::test]
    async fn tick_advances_to_the_next_timer_only() {
        let (clock, _log) = clock_and_log();
        let first = tokio::spawn(clock.sleep(Millis::from_millis(5)));
        let second = tokio::spawn(clock.sleep(Millis::from_millis(12)));
        clock.flush().await;

        clock.tick();
        clock.flush().await;
        assert_eq!(clock.now().mono_ms, 5);
        assert!(first.is_finished());
        assert!(!second.is_finished());

        clock.tick();
        clock.flush().await;
        assert_eq!(clock.now().mono_ms, 12);
        assert!(second.is_finished());

        // Nothing pending: tick is a no-op.
        clock.tick();
        assert_eq!(clock.now().mono_ms, 12);
    }

    #[tokio::test]
    async fn abandoned_sleeps_do_not_count_or_fire() {
        let (clock, log) = clock_and_log();
        let fut = clock.sleep(Millis::from_millis(10));
        assert_eq!(clock.pending_timer_count(), 1);

        drop(fut);
        assert_eq!(clock.pending_timer_count(), 0);

        clock.advance_by(Millis::from_millis(20));
        assert_eq!(log.count_of("time:sleep:end"), 0);
    }

    #[tokio::test]
    async fn timers_scheduled_during_a_drain_fire_in_the_same_drain() {
        let (clock, _log) = clock_and_log();
        let fired = Arc::new(AtomicUsize::new(0));

        let inner_clock = clock.clone();
        let inner_fired = Arc::clone(&fired);
        let once = Arc::new(AtomicBool::new(false));
        clock
            .interval(
                Millis::from_millis(10),
                Box::new(move || {
                    if !once.swap(true, Ordering::SeqCst) {
                        // Schedule a second interval due inside this drain.
                        let late_fired = Arc::clone(&inner_fired);
                        inner_clock
                            .interval(
                                Millis::from_millis(5),
                                Box::new(move || {
                                    late_fired.fetch_add(1, Ordering::SeqCst);
                                }),
                            )
                            .unwrap();
                    }
                }),
            )
            .unwrap();

        clock.advance_by(Millis::from_millis(20));
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }
}
