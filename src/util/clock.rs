//! Millisecond clocks.
//!
//! Every time-gated decision in the scheduler (reaper cadence, staleness,
//! queue age, log throttling) reads time through [`Clock`] so tests can drive
//! it deterministically with [`ManualClock`].

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Source of the current time in milliseconds since epoch.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds.
    fn now_ms(&self) -> u128;
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u128 {
        now_ms()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<u128>>,
}

impl ManualClock {
    /// Create a clock frozen at `start_ms`.
    #[must_use]
    pub fn new(start_ms: u128) -> Self {
        Self {
            now: Arc::new(Mutex::new(start_ms)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by.as_millis();
    }

    /// Jump to an absolute time.
    pub fn set(&self, now_ms: u128) {
        *self.now.lock() = now_ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u128 {
        *self.now.lock()
    }
}
