//! Monotonic Time Sources
//!
//! The flow-state table only ever compares ticks against each other, so a clock
//! is nothing more than a monotonic `u64` counter measured in nanoseconds.
//!
//! - [`SystemClock`]: backed by [`std::time::Instant`]; the default.
//! - [`ManualClock`]: advanced by hand, for deterministic tests and replays.
//!
//! ## Example
//!
//! ```
//! use flowstate::clock::{Clock, ManualClock};
//! use std::time::Duration;
//!
//! let clock = ManualClock::new(100);
//! clock.advance(Duration::from_nanos(50));
//! assert_eq!(clock.tick(), 150);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic tick source.
pub trait Clock: Send + Sync {
    /// Returns the current tick in nanoseconds.
    fn tick(&self) -> u64;
}

/// Wall-independent monotonic clock measuring nanoseconds since its creation.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[inline]
    fn tick(&self) -> u64 {
        // u64 nanoseconds cover ~584 years of uptime
        self.origin.elapsed().as_nanos() as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.advance_ticks(by.as_nanos() as u64);
    }

    /// Moves the clock forward by a raw tick count.
    pub fn advance_ticks(&self, ticks: u64) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }

    /// Sets the absolute reading.
    pub fn set(&self, tick: u64) {
        self.now.store(tick, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn tick(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
