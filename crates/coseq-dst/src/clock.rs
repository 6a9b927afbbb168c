//! Simulated time.
//!
//! The clock only moves when the simulation charges a delay to a step, so
//! consumer deadlines expire at the same operation on every replay.

use std::sync::atomic::{AtomicU64, Ordering};

/// Leave room for advances without overflow.
const TIME_NS_MAX: u64 = u64::MAX - 1_000_000_000_000;

/// Nanosecond clock advanced explicitly by the simulation.
pub struct SimClock {
    now_ns: AtomicU64,
}

impl SimClock {
    #[must_use]
    pub fn new() -> Self {
        Self::with_start_time_ns(0)
    }

    #[must_use]
    pub fn with_start_time_ns(start_ns: u64) -> Self {
        debug_assert!(start_ns <= TIME_NS_MAX, "Start time too large");
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    #[must_use]
    pub fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn now_us(&self) -> u64 {
        self.now_ns() / 1_000
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.now_ns() / 1_000_000
    }

    pub fn advance_ns(&self, delta_ns: u64) {
        debug_assert!(delta_ns > 0, "Delta must be positive");
        debug_assert!(self.now_ns() <= TIME_NS_MAX - delta_ns, "Time advance would overflow");
        self.now_ns.fetch_add(delta_ns, Ordering::Release);
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.advance_ns(delta_ms * 1_000_000);
    }

    /// Charge a step's delay; zero is a no-op.
    pub fn sleep_ns(&self, duration_ns: u64) {
        if duration_ns > 0 {
            self.advance_ns(duration_ns);
        }
    }

    /// A deadline `budget_ns` from now.
    #[must_use]
    pub fn deadline_after_ns(&self, budget_ns: u64) -> Deadline {
        debug_assert!(budget_ns > 0, "Deadline budget must be positive");
        Deadline {
            at_ns: self.now_ns().saturating_add(budget_ns),
        }
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Point in simulated time after which a consumer gives up on a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at_ns: u64,
}

impl Deadline {
    #[must_use]
    pub fn at_ns(&self) -> u64 {
        self.at_ns
    }

    #[must_use]
    pub fn is_expired(&self, clock: &SimClock) -> bool {
        clock.now_ns() >= self.at_ns
    }

    #[must_use]
    pub fn remaining_ns(&self, clock: &SimClock) -> u64 {
        self.at_ns.saturating_sub(clock.now_ns())
    }
}
