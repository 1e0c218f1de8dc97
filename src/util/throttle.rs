//! Rate limiting for repetitive log events.

use std::time::Duration;

/// Allows an event through at most once per interval.
///
/// The scheduler ticks every few seconds; without this, "not leader" and
/// per-tick admission summaries would flood the logs.
#[derive(Debug, Clone)]
pub struct LogThrottle {
    interval_ms: u128,
    last_ms: Option<u128>,
}

impl LogThrottle {
    /// Create a throttle with the given minimum spacing between events.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis(),
            last_ms: None,
        }
    }

    /// Returns true (and records `now_ms`) if the event may be emitted.
    pub fn should_log(&mut self, now_ms: u128) -> bool {
        let due = self
            .last_ms
            .is_none_or(|last| now_ms.saturating_sub(last) >= self.interval_ms);
        if due {
            self.last_ms = Some(now_ms);
        }
        due
    }
}
