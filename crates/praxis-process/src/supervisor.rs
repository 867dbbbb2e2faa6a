use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use praxis_clock::Clock;
use praxis_types::{EventKind, EventSink, Millis, ProcessId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    /// Never restart.
    None,
    /// Restart only the failed process.
    OneForOne,
}

/// Restart budget: at most `count` restarts within a `within` window,
/// measured on the monotonic track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartLimit {
    pub count: u32,
    pub within: Millis,
}

/// Exponential backoff between restarts, with optional ±jitter%.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Millis,
    pub max: Millis,
    pub factor: f64,
    pub jitter_pct: Option<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SupervisionStrategy {
    kind: StrategyKind,
    max_restarts: Option<RestartLimit>,
    backoff: Option<BackoffPolicy>,
}

impl SupervisionStrategy {
    pub fn none() -> Self {
        Self {
            kind: StrategyKind::None,
            max_restarts: None,
            backoff: None,
        }
    }

    pub fn one_for_one() -> Self {
        Self {
            kind: StrategyKind::OneForOne,
            max_restarts: None,
            backoff: None,
        }
    }

    pub fn max_restarts(mut self, count: u32, within: Millis) -> Self {
        self.max_restarts = Some(RestartLimit { count, within });
        self
    }

    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = Some(policy);
        self
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }
}

struct RestartWindow {
    window_start_mono: i64,
    restarts: u32,
}

/// Restart decision primitives with windowed budgets and jittered backoff.
///
/// The supervisor owns no processes: a parent consults `should_restart` and
/// `restart_delay`, then performs the respawn itself. Windows are keyed by a
/// stable process identity chosen by the caller (typically the first
/// incarnation's id) and measured on the monotonic track, so wall jumps
/// cannot stretch or shrink a restart budget.
pub struct Supervisor {
    strategy: SupervisionStrategy,
    clock: Arc<dyn Clock>,
    sink: EventSink,
    windows: Mutex<HashMap<ProcessId, RestartWindow>>,
    rng: Mutex<StdRng>,
}

impl Supervisor {
    pub fn new(strategy: SupervisionStrategy, clock: Arc<dyn Clock>, sink: EventSink) -> Self {
        Self::with_rng(strategy, clock, sink, StdRng::from_os_rng())
    }

    /// Deterministic jitter for tests.
    pub fn with_rng_seed(
        strategy: SupervisionStrategy,
        clock: Arc<dyn Clock>,
        sink: EventSink,
        seed: u64,
    ) -> Self {
        Self::with_rng(strategy, clock, sink, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        strategy: SupervisionStrategy,
        clock: Arc<dyn Clock>,
        sink: EventSink,
        rng: StdRng,
    ) -> Self {
        Self {
            strategy,
            clock,
            sink,
            windows: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Decide whether `pid` may be restarted, updating window bookkeeping.
    ///
    /// Emits `supervisor:giveup` when the budget is exhausted.
    pub fn should_restart(&self, pid: ProcessId) -> bool {
        if self.strategy.kind == StrategyKind::None {
            return false;
        }
        let Some(limit) = self.strategy.max_restarts else {
            return true;
        };
        let now_mono = self.clock.now().mono_ms;
        let gave_up = {
            let mut windows = self.windows();
            match windows.get_mut(&pid) {
                Some(window)
                    if now_mono - window.window_start_mono <= limit.within.as_i64() =>
                {
                    if window.restarts >= limit.count {
                        true
                    } else {
                        window.restarts += 1;
                        false
                    }
                }
                _ => {
                    windows.insert(
                        pid,
                        RestartWindow {
                            window_start_mono: now_mono,
                            restarts: 1,
                        },
                    );
                    false
                }
            }
        };
        if gave_up {
            self.sink.emit_at(
                self.clock.now(),
                EventKind::SupervisorGiveup {
                    pid,
                    restarts: limit.count,
                },
            );
            tracing::warn!(pid = %pid, "restart budget exhausted");
            return false;
        }
        true
    }

    /// The backoff delay before the next restart of `pid`.
    ///
    /// Emits `supervisor:restart` with the in-window attempt number.
    pub fn restart_delay(&self, pid: ProcessId) -> Millis {
        let attempt = self
            .windows()
            .get(&pid)
            .map(|window| window.restarts)
            .unwrap_or(1);
        let delay = match &self.strategy.backoff {
            None => Millis::ZERO,
            Some(backoff) => {
                let raw = backoff
                    .initial
                    .scale(backoff.factor.powi(attempt as i32 - 1))
                    .min(backoff.max);
                match backoff.jitter_pct {
                    Some(pct) if pct > 0 && !raw.is_zero() => {
                        let span = raw.as_i64() as f64 * f64::from(pct) / 100.0;
                        let offset = self.rng().random_range(-span..=span);
                        Millis::from_signed((raw.as_i64() as f64 + offset) as i64)
                    }
                    _ => raw,
                }
            }
        };
        self.sink.emit_at(
            self.clock.now(),
            EventKind::SupervisorRestart {
                pid,
                attempt,
                delay_ms: delay,
            },
        );
        delay
    }

    fn windows(&self) -> MutexGuard<'_, HashMap<ProcessId, RestartWindow>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("strategy", &self.strategy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use praxis_clock::ControlledClock;
    use praxis_types::EventLog;

    use super::*;
    use crate::process::{Actor, StopReason, Tools};
    use crate::system::{SpawnOptions, System};

    fn setup() -> (ControlledClock, EventLog) {
        let log = EventLog::new();
        (ControlledClock::new(log.sink()), log)
    }

    fn pid() -> ProcessId {
        ProcessId::new()
    }

    #[test]
    fn none_strategy_never_restarts() {
        let (clock, log) = setup();
        let supervisor =
            Supervisor::new(SupervisionStrategy::none(), Arc::new(clock), log.sink());
        assert!(!supervisor.should_restart(pid()));
    }

    #[test]
    fn no_limit_means_unbounded_restarts() {
        let (clock, log) = setup();
        let supervisor = Supervisor::new(
            SupervisionStrategy::one_for_one(),
            Arc::new(clock),
            log.sink(),
        );
        let target = pid();
        for _ in 0..50 {
            assert!(supervisor.should_restart(target));
        }
    }

    #[test]
    fn the_window_gives_up_at_the_limit_and_resets_after_expiry() {
        let (clock, log) = setup();
        let supervisor = Supervisor::new(
            SupervisionStrategy::one_for_one().max_restarts(3, Millis::from_millis(1_000)),
            Arc::new(clock.clone()),
            log.sink(),
        );
        let target = pid();

        assert!(supervisor.should_restart(target));
        assert!(supervisor.should_restart(target));
        assert!(supervisor.should_restart(target));
        assert!(!supervisor.should_restart(target));
        assert_eq!(log.count_of("supervisor:giveup"), 1);

        // Window expired: a fresh budget.
        clock.advance_by(Millis::from_millis(1_001));
        assert!(supervisor.should_restart(target));
    }

    #[test]
    fn windows_are_tracked_per_process() {
        let (clock, log) = setup();
        let supervisor = Supervisor::new(
            SupervisionStrategy::one_for_one().max_restarts(1, Millis::from_millis(1_000)),
            Arc::new(clock),
            log.sink(),
        );
        let first = pid();
        let second = pid();

        assert!(supervisor.should_restart(first));
        assert!(!supervisor.should_restart(first));
        assert!(supervisor.should_restart(second));
    }

    #[test]
    fn delays_follow_capped_backoff_without_jitter() {
        let (clock, log) = setup();
        let supervisor = Supervisor::new(
            SupervisionStrategy::one_for_one()
                .max_restarts(10, Millis::from_millis(60_000))
                .backoff(BackoffPolicy {
                    initial: Millis::from_millis(100),
                    max: Millis::from_millis(400),
                    factor: 2.0,
                    jitter_pct: None,
                }),
            Arc::new(clock),
            log.sink(),
        );
        let target = pid();

        let mut delays = Vec::new();
        for _ in 0..4 {
            assert!(supervisor.should_restart(target));
            delays.push(supervisor.restart_delay(target));
        }

        assert_eq!(
            delays,
            vec![
                Millis::from_millis(100),
                Millis::from_millis(200),
                Millis::from_millis(400),
                Millis::from_millis(400),
            ]
        );
        assert_eq!(log.count_of("supervisor:restart"), 4);
    }

    #[test]
    fn no_backoff_means_zero_delay() {
        let (clock, log) = setup();
        let supervisor = Supervisor::new(
            SupervisionStrategy::one_for_one().max_restarts(5, Millis::from_millis(1_000)),
            Arc::new(clock),
            log.sink(),
        );
        let target = pid();
        assert!(supervisor.should_restart(target));
        assert_eq!(supervisor.restart_delay(target), Millis::ZERO);
    }

    #[test]
    fn jitter_stays_within_bounds_and_never_goes_negative() {
        let (clock, log) = setup();
        let supervisor = Supervisor::with_rng_seed(
            SupervisionStrategy::one_for_one().backoff(BackoffPolicy {
                initial: Millis::from_millis(100),
                max: Millis::from_millis(100),
                factor: 1.0,
                jitter_pct: Some(50),
            }),
            Arc::new(clock),
            log.sink(),
            7,
        );
        let target = pid();

        for _ in 0..20 {
            assert!(supervisor.should_restart(target));
            let delay = supervisor.restart_delay(target).as_u64();
            assert!((50..=150).contains(&delay), "delay {delay} out of bounds");
        }
    }

    struct CrashOnMessage;

    #[async_trait]
    impl Actor for CrashOnMessage {
        type Msg = ();

        async fn handle(&mut self, _msg: (), _tools: &mut Tools<()>) -> anyhow::Result<()> {
            anyhow::bail!("always failing");
        }

        async fn on_stop(
            &mut self,
            _reason: &StopReason,
            _tools: &mut Tools<()>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test_log::test(tokio::test)]
    async fn a_crashing_process_is_restarted_three_times_then_given_up_on() {
        let log = EventLog::new();
        let clock = ControlledClock::new(log.sink());
        let system = System::new(Arc::new(clock.clone()), log.sink());
        let supervisor = Supervisor::new(
            SupervisionStrategy::one_for_one().max_restarts(3, Millis::from_millis(1_000)),
            Arc::new(clock.clone()),
            log.sink(),
        );

        // The restart cycle belongs to the caller; the supervisor only
        // decides. Windows are keyed on the first incarnation's id.
        let mut identity = None;
        let mut restarts = 0;
        loop {
            let proc_ref = system.spawn(CrashOnMessage, SpawnOptions::new());
            let key = *identity.get_or_insert(proc_ref.id());
            proc_ref.ready().await;
            proc_ref.send(());
            proc_ref.terminated().await;
            assert_eq!(proc_ref.status(), crate::process::ProcessStatus::Failed);

            if !supervisor.should_restart(key) {
                break;
            }
            restarts += 1;
            let delay = supervisor.restart_delay(key);
            clock.advance_by(delay);
        }

        assert_eq!(restarts, 3);
        assert_eq!(log.count_of("supervisor:giveup"), 1);
        assert_eq!(log.count_of("process:fail"), 4);
    }
}
