use praxis_types::{EventKind, Fault, Millis};

use crate::effect::Effect;

/// Capped exponential backoff for retried effects.
///
/// Attempt N (1-indexed) waits `min(base_delay * backoff_factor^(N-1),
/// max_delay)` before attempt N+1. There is never a delay after the final
/// attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Millis,
    backoff_factor: f64,
    max_delay: Option<Millis>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Millis) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor: 2.0,
            max_delay: None,
        }
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn max_delay(mut self, cap: Millis) -> Self {
        self.max_delay = Some(cap);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay consumed after a failed attempt `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Millis {
        let exponent = attempt.saturating_sub(1);
        let delay = self.base_delay.scale(self.backoff_factor.powi(exponent as i32));
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

impl<A: Send + 'static, E: Send + 'static> Effect<A, E> {
    /// Run effects produced by `make` until one succeeds or the policy is
    /// exhausted.
    ///
    /// Effects are single-shot values, so retry takes a factory rather than
    /// re-running a consumed effect. Cancellation between attempts
    /// short-circuits with the last observed error.
    pub fn retry(
        policy: RetryPolicy,
        mut make: impl FnMut() -> Effect<A, E> + Send + 'static,
    ) -> Effect<A, E> {
        Effect::new(move |env| {
            Box::pin(async move {
                let attempts = policy.max_attempts.max(1);
                let mut last: Option<Fault<E>> = None;
                for attempt in 1..=attempts {
                    if env.cancel.is_cancelled() {
                        return Err(last.take().unwrap_or(Fault::Interrupted));
                    }
                    env.emit(EventKind::RetryAttempt { attempt });
                    match make().eval(env.clone()).await {
                        Ok(value) => {
                            env.emit(EventKind::RetrySuccess { attempt });
                            return Ok(value);
                        }
                        Err(fault) => {
                            if attempt == attempts {
                                env.emit(EventKind::RetryExhausted { attempts });
                                return Err(fault);
                            }
                            last = Some(fault);
                        }
                    }
                    let delay = policy.delay_for(attempt);
                    if !delay.is_zero() {
                        env.emit(EventKind::RetryDelay {
                            attempt,
                            delay_ms: delay,
                        });
                        let timer = env.clock.sleep(delay);
                        tokio::select! {
                            biased;
                            _ = env.cancel.cancelled() => {
                                return Err(last.take().unwrap_or(Fault::Interrupted));
                            }
                            _ = timer => {}
                        }
                    }
                }
                Err(last.take().unwrap_or(Fault::Interrupted))
            })
        })
    }
}
