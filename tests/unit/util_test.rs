//! Tests for utility functions

use std::time::Duration;

use changeset_scheduler::util::{now_ms, Clock, LogThrottle, ManualClock, SystemClock};

#[test]
fn test_manual_clock_is_shared_between_clones() {
    let clock = ManualClock::new(1_000);
    let observer = clock.clone();

    clock.advance(Duration::from_secs(2));
    assert_eq!(observer.now_ms(), 3_000);

    observer.set(10);
    assert_eq!(clock.now_ms(), 10);
}

#[test]
fn test_system_clock_tracks_wall_time() {
    let before = now_ms();
    let reading = SystemClock.now_ms();
    assert!(reading >= before);
}

#[test]
fn test_log_throttle_with_manual_clock() {
    let clock = ManualClock::new(0);
    let mut throttle = LogThrottle::new(Duration::from_secs(60));

    assert!(throttle.should_log(clock.now_ms()));
    clock.advance(Duration::from_secs(59));
    assert!(!throttle.should_log(clock.now_ms()));
    clock.advance(Duration::from_secs(1));
    assert!(throttle.should_log(clock.now_ms()));
}
