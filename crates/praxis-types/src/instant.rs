use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A branded, non-negative count of milliseconds.
///
/// Non-negativity is structural (`u64`); conversion from signed values is an
/// explicit, saturating operation. All durations in the runtime — sleeps,
/// timeouts, strides, backoff delays — are `Millis`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Millis(u64);

impl Millis {
    pub const ZERO: Millis = Millis(0);

    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    /// Convert a signed millisecond count, saturating negatives to zero.
    pub fn from_signed(ms: i64) -> Self {
        Self(ms.max(0) as u64)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn to_duration(self) -> Duration {
        Duration::from_millis(self.0)
    }

    pub const fn saturating_add(self, other: Millis) -> Millis {
        Millis(self.0.saturating_add(other.0))
    }

    /// Scale by a non-negative factor, rounding toward zero. Used for
    /// exponential backoff math; negative or non-finite factors read as zero.
    pub fn scale(self, factor: f64) -> Millis {
        if !factor.is_finite() || factor <= 0.0 {
            return Millis::ZERO;
        }
        let scaled = (self.0 as f64) * factor;
        if scaled >= u64::MAX as f64 {
            Millis(u64::MAX)
        } else {
            Millis(scaled as u64)
        }
    }
}

impl fmt::Display for Millis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Two-track timestamp produced atomically by a Clock.
///
/// `wall_ms` is milliseconds since the Unix epoch and may jump in either
/// direction; `mono_ms` is a non-decreasing counter from an arbitrary
/// baseline and is the only track valid for measuring durations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instant {
    pub wall_ms: i64,
    pub mono_ms: i64,
}

impl Instant {
    pub const fn new(wall_ms: i64, mono_ms: i64) -> Self {
        Self { wall_ms, mono_ms }
    }

    /// Elapsed monotonic time since `earlier`, saturating at zero.
    pub fn mono_since(&self, earlier: &Instant) -> Millis {
        Millis::from_signed(self.mono_ms - earlier.mono_ms)
    }

    /// Elapsed wall time since `earlier`. May be negative after a wall jump.
    pub fn wall_since(&self, earlier: &Instant) -> i64 {
        self.wall_ms - earlier.wall_ms
    }
}
