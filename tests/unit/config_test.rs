//! Tests for configuration validation

use std::time::Duration;

use changeset_scheduler::config::SchedulerConfig;

#[test]
fn test_default_config_is_valid() {
    let cfg = SchedulerConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.max_concurrent_per_tenant, 5);
    assert_eq!(cfg.max_retry, 3);
    assert_eq!(cfg.tick_interval(), Duration::from_secs(5));
}

#[test]
fn test_zero_cap_is_invalid() {
    let cfg = SchedulerConfig {
        max_concurrent_per_tenant: 0,
        ..SchedulerConfig::default()
    };
    let err = cfg.validate().unwrap_err();
    assert!(err.contains("max_concurrent_per_tenant"));
}

#[test]
fn test_zero_tick_interval_is_invalid() {
    let cfg = SchedulerConfig {
        tick_interval_secs: 0,
        ..SchedulerConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_zero_max_retry_is_allowed() {
    let cfg = SchedulerConfig {
        max_retry: 0,
        ..SchedulerConfig::default()
    };
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_partial_json_takes_defaults() {
    let cfg = SchedulerConfig::from_json_str(
        r#"{"max_concurrent_per_tenant": 2, "stuck_timeout_secs": 600}"#,
    )
    .unwrap();
    assert_eq!(cfg.max_concurrent_per_tenant, 2);
    assert_eq!(cfg.stuck_timeout(), Duration::from_secs(600));
    assert_eq!(cfg.max_queue_age(), Duration::from_secs(3 * 24 * 60 * 60));
}

#[test]
fn test_invalid_json_is_rejected() {
    assert!(SchedulerConfig::from_json_str("{").is_err());
    assert!(SchedulerConfig::from_json_str(r#"{"tick_interval_secs": 0}"#).is_err());
}

#[test]
fn test_derived_settings() {
    let cfg = SchedulerConfig {
        stuck_check_interval_secs: 60,
        max_retry: 7,
        log_throttle_secs: 10,
        store_retry_attempts: 5,
        store_retry_backoff_ms: 20,
        ..SchedulerConfig::default()
    };

    let reaper = cfg.reaper_settings();
    assert_eq!(reaper.stuck_check_interval, Duration::from_secs(60));
    assert_eq!(reaper.max_retry, 7);

    let dispatcher = cfg.dispatcher_settings();
    assert_eq!(dispatcher.log_throttle, Duration::from_secs(10));

    let retry = cfg.retry_policy();
    assert_eq!(retry.attempts, 5);
    assert_eq!(retry.backoff, Duration::from_millis(20));
}
