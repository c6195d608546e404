// Monotonic time base and the 500ms scheduling grid.

use std::ops::{Add, Sub};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Grid resolution. Every scheduling decision lands on a multiple of this.
pub const GRID: Duration = Duration::from_millis(500);

/// Minimum spacing between any two probe launches.
pub const MIN_SPACING: Duration = Duration::from_millis(500);

/// Minimum spacing between two consecutive write probes.
pub const WRITE_SPACING: Duration = Duration::from_millis(1000);

/// An instant on the crate's monotonic timeline.
///
/// Stored as the offset from an arbitrary process-local epoch. Only
/// differences are meaningful; wall-clock time never enters scheduling
/// arithmetic. The type is `Copy` and totally ordered, so planned ops can
/// carry their launch instant by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MonoTime(Duration);

impl MonoTime {
    pub const ZERO: MonoTime = MonoTime(Duration::ZERO);

    pub fn from_millis(ms: u64) -> Self {
        MonoTime(Duration::from_millis(ms))
    }

    pub fn as_millis(&self) -> u64 {
        self.0.as_millis() as u64
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Largest grid instant less than or equal to `self`.
    pub fn grid_floor(&self) -> MonoTime {
        MonoTime::from_millis(self.as_millis() - self.as_millis() % GRID.as_millis() as u64)
    }

    /// Smallest grid instant greater than or equal to `self`.
    pub fn grid_ceil(&self) -> MonoTime {
        let floor = self.grid_floor();
        if floor == *self {
            floor
        } else {
            floor + GRID
        }
    }

    /// Index of the grid cell containing this instant.
    pub fn cell(&self) -> u64 {
        self.as_millis() / GRID.as_millis() as u64
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn saturating_since(&self, earlier: MonoTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for MonoTime {
    type Output = MonoTime;

    fn add(self, rhs: Duration) -> MonoTime {
        MonoTime(self.0 + rhs)
    }
}

impl Sub<Duration> for MonoTime {
    type Output = MonoTime;

    fn sub(self, rhs: Duration) -> MonoTime {
        MonoTime(self.0.saturating_sub(rhs))
    }
}

/// Injectable monotonic time source.
///
/// The only contract is strictly non-decreasing progress across calls.
/// Behavior across host sleep is undefined; the scheduler detects large
/// jumps and smooths the cadence instead of firing backlog.
pub trait Clock: Send + Sync {
    fn now(&self) -> MonoTime;
}

/// Production clock anchored at construction time.
///
/// Built on `tokio::time::Instant` so paused-runtime tests can advance it
/// by arbitrary amounts.
pub struct SystemClock {
    anchor: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MonoTime {
        MonoTime(self.anchor.elapsed())
    }
}

/// Hand-driven clock for unit tests.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(ms: u64) -> Self {
        let clock = Self::new();
        clock.set(ms);
        clock
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set(&self, ms: u64) {
        *self.now.lock().unwrap() = Duration::from_millis(ms);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> MonoTime {
        MonoTime(*self.now.lock().unwrap())
    }
}
