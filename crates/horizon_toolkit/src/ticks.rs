//! # Logical time
//!
//! Delays and intervals throughout the toolkit are expressed in [`Ticks`], the
//! host's logical time unit. A tick maps to wall-clock time through a fixed
//! [`TickRate`]; the default rate is [`TICKS_PER_SECOND`] (20 Hz, 50 ms per
//! tick), matching the host's main loop.
//!
//! Keeping the unit abstract lets the sync context count real game ticks
//! (which stretch when the server lags) while the async context converts the
//! same numbers into timer durations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Number of ticks the host runs per second at its nominal rate.
pub const TICKS_PER_SECOND: u32 = 20;

/// Milliseconds in one second.
pub const MILLISECONDS_PER_SECOND: u64 = 1000;

/// Milliseconds in one tick at the nominal rate.
pub const MILLISECONDS_PER_TICK: u64 = MILLISECONDS_PER_SECOND / TICKS_PER_SECOND as u64;

/// A count of logical ticks.
///
/// The value is signed so that malformed input (a negative delay computed by
/// plugin code, for example) can be represented and rejected by the scheduler
/// with a validation error instead of silently wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticks(pub i64);

impl Ticks {
    pub const ZERO: Ticks = Ticks(0);
    pub const ONE: Ticks = Ticks(1);

    pub const fn new(ticks: i64) -> Self {
        Self(ticks)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    /// Whole seconds at the nominal tick rate.
    pub const fn seconds(seconds: i64) -> Self {
        Self(seconds * TICKS_PER_SECOND as i64)
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Converts a wall-clock duration to ticks at the nominal rate, rounding down.
    pub fn from_duration(duration: Duration) -> Self {
        TickRate::default().ticks_in(duration)
    }

    /// Converts to wall-clock time at the nominal rate. Negative counts map to zero.
    pub fn to_duration(self) -> Duration {
        TickRate::default().duration_of(self)
    }
}

impl From<Duration> for Ticks {
    fn from(duration: Duration) -> Self {
        Ticks::from_duration(duration)
    }
}

impl From<u32> for Ticks {
    fn from(ticks: u32) -> Self {
        Ticks(ticks as i64)
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}t", self.0)
    }
}

/// Fixed conversion between ticks and wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickRate {
    ticks_per_second: u32,
}

impl TickRate {
    /// Creates a tick rate. Callers validate the range through
    /// [`SchedulerConfig::validate`](crate::config::SchedulerConfig::validate);
    /// a zero rate is clamped to one tick per second.
    pub fn new(ticks_per_second: u32) -> Self {
        Self {
            ticks_per_second: ticks_per_second.max(1),
        }
    }

    pub fn ticks_per_second(&self) -> u32 {
        self.ticks_per_second
    }

    /// Wall-clock length of a single tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.ticks_per_second as u64)
    }

    pub fn duration_of(&self, ticks: Ticks) -> Duration {
        if ticks.0 <= 0 {
            return Duration::ZERO;
        }
        self.tick_duration().saturating_mul(ticks.0.min(u32::MAX as i64) as u32)
    }

    pub fn ticks_in(&self, duration: Duration) -> Ticks {
        let tick_micros = self.tick_duration().as_micros().max(1);
        Ticks((duration.as_micros() / tick_micros).min(i64::MAX as u128) as i64)
    }
}

impl Default for TickRate {
    fn default() -> Self {
        Self::new(TICKS_PER_SECOND)
    }
}
