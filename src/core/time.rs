//! Time primitives for lease and dedup bookkeeping.
//!
//! The coordinator works with two independent notions of time:
//! - [`CoarseTimePoint`] - a coarse monotonic clock, used for leader leases
//!   and cache validity horizons. Never compared against wall-clock time.
//! - [`MicrosTime`] - a physical-microsecond timestamp, the physical
//!   component of hybrid time, used for the hybrid-time lease bound.
//!
//! [`RestartSafeClock`] is the monotonic clock used for retryable-request
//! aging: its zero is re-anchored on process start so deadlines recovered
//! from a previous incarnation remain comparable as stored offsets.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Physical time in microseconds (the physical component of hybrid time).
///
/// Zero means "no value"; see `PhysicalComponentLease` in the lease module.
pub type MicrosTime = u64;

/// Process-wide monotonic anchor. All coarse time points are offsets from it.
fn mono_anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// A point on the coarse monotonic clock, in microseconds since the process
/// anchor.
///
/// Supports the sentinel values [`CoarseTimePoint::MIN`] (used for "no
/// lease") and [`CoarseTimePoint::MAX`] (used for "no deadline"). Ordinary
/// points produced by [`CoarseTimePoint::now`] start near zero and grow.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CoarseTimePoint {
    micros: i64,
}

impl CoarseTimePoint {
    /// The minimum representable point. Precedes every clock reading.
    pub const MIN: CoarseTimePoint = CoarseTimePoint { micros: i64::MIN };

    /// The maximum representable point. Follows every clock reading.
    pub const MAX: CoarseTimePoint = CoarseTimePoint { micros: i64::MAX };

    /// Build a point from raw microseconds. Intended for tests and
    /// serialization; production readings come from [`CoarseTimePoint::now`].
    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Raw microsecond value.
    pub const fn micros(self) -> i64 {
        self.micros
    }

    /// Current reading of the coarse monotonic clock.
    pub fn now() -> Self {
        Self {
            micros: mono_anchor().elapsed().as_micros() as i64,
        }
    }

    /// Point advanced by `delta`. Sentinels are absorbing.
    pub fn add(self, delta: Duration) -> Self {
        if self == Self::MIN || self == Self::MAX {
            return self;
        }
        Self {
            micros: self.micros.saturating_add(delta.as_micros() as i64),
        }
    }

    /// Duration until `deadline`, or zero if the deadline has passed.
    pub fn until(self, deadline: CoarseTimePoint) -> Duration {
        if deadline.micros <= self.micros {
            return Duration::ZERO;
        }
        Duration::from_micros(deadline.micros.saturating_sub(self.micros) as u64)
    }

    /// Convert to an [`Instant`] for condvar deadlines. Sentinels saturate.
    pub fn to_instant(self) -> Instant {
        let anchor = mono_anchor();
        match self {
            Self::MIN => anchor,
            Self::MAX => anchor + Duration::from_secs(u32::MAX as u64),
            _ => anchor + Duration::from_micros(self.micros.max(0) as u64),
        }
    }
}

impl std::fmt::Display for CoarseTimePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::MIN => write!(f, "-inf"),
            Self::MAX => write!(f, "+inf"),
            _ => write!(f, "{}us", self.micros),
        }
    }
}

/// A monotonic clock whose readings survive restarts as relative offsets.
///
/// The clock reads as "offset + time since process start". Recovering the
/// highest reading observed by a previous incarnation and passing it to
/// [`RestartSafeClock::from_recovered`] re-anchors the clock so deadlines
/// persisted as [`RestartSafeTimePoint`] offsets stay meaningful across the
/// restart. Wall-clock time is never consulted.
#[derive(Debug, Clone)]
pub struct RestartSafeClock {
    offset: Duration,
    anchor: Instant,
}

/// A reading of [`RestartSafeClock`], an offset from the re-anchored zero.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RestartSafeTimePoint {
    micros: u64,
}

impl RestartSafeTimePoint {
    /// Build a reading from raw microseconds.
    pub const fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    /// Raw microsecond offset.
    pub const fn micros(self) -> u64 {
        self.micros
    }

    /// Reading advanced by `delta`.
    pub fn add(self, delta: Duration) -> Self {
        Self {
            micros: self.micros.saturating_add(delta.as_micros() as u64),
        }
    }

    /// Whether this reading is at or past `deadline`.
    pub const fn reached(self, deadline: RestartSafeTimePoint) -> bool {
        self.micros >= deadline.micros
    }
}

impl RestartSafeClock {
    /// A clock anchored at zero (fresh replica, nothing recovered).
    pub fn new() -> Self {
        Self {
            offset: Duration::ZERO,
            anchor: Instant::now(),
        }
    }

    /// A clock re-anchored so new readings follow `recovered`.
    pub fn from_recovered(recovered: RestartSafeTimePoint) -> Self {
        Self {
            offset: Duration::from_micros(recovered.micros),
            anchor: Instant::now(),
        }
    }

    /// Current reading.
    pub fn now(&self) -> RestartSafeTimePoint {
        RestartSafeTimePoint {
            micros: (self.offset + self.anchor.elapsed()).as_micros() as u64,
        }
    }
}

impl Default for RestartSafeClock {
    fn default() -> Self {
        Self::new()
    }
}
