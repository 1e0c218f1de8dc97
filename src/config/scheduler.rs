//! Scheduler configuration.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::admission::DEFAULT_MAX_CONCURRENT_PER_TENANT;
use crate::core::dispatcher::DispatcherSettings;
use crate::core::reaper::ReaperSettings;
use crate::core::retry::RetryPolicy;
use crate::core::AppResult;

/// Prefix of environment variables read by [`SchedulerConfig::from_env`].
pub const ENV_PREFIX: &str = "CHANGESET_SCHEDULER_";

/// Root scheduler configuration. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Running change sets allowed per tenant across all its queue keys.
    pub max_concurrent_per_tenant: usize,
    /// Seconds between tick starts.
    pub tick_interval_secs: u64,
    /// Seconds between reaper runs.
    pub stuck_check_interval_secs: u64,
    /// Seconds without an update after which a RUNNING change set is stuck.
    pub stuck_timeout_secs: u64,
    /// Seconds a change set may stay QUEUED before it is skipped.
    pub max_queue_age_secs: u64,
    /// Stuck-run recoveries allowed before a change set is skipped.
    pub max_retry: u32,
    /// Minimum seconds between repetitive log lines.
    pub log_throttle_secs: u64,
    /// Attempts per store call on transient errors.
    pub store_retry_attempts: u32,
    /// Pause between store retry attempts in milliseconds.
    pub store_retry_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_tenant: DEFAULT_MAX_CONCURRENT_PER_TENANT,
            tick_interval_secs: 5,
            stuck_check_interval_secs: 30 * 60,
            stuck_timeout_secs: 90 * 60,
            max_queue_age_secs: 3 * 24 * 60 * 60,
            max_retry: 3,
            log_throttle_secs: 5 * 60,
            store_retry_attempts: 3,
            store_retry_backoff_ms: 100,
        }
    }
}

impl SchedulerConfig {
    /// Validate configuration values.
    ///
    /// # Errors
    /// A message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_per_tenant == 0 {
            return Err("max_concurrent_per_tenant must be greater than 0".into());
        }
        if self.tick_interval_secs == 0 {
            return Err("tick_interval_secs must be greater than 0".into());
        }
        if self.stuck_check_interval_secs == 0 {
            return Err("stuck_check_interval_secs must be greater than 0".into());
        }
        if self.stuck_timeout_secs == 0 {
            return Err("stuck_timeout_secs must be greater than 0".into());
        }
        if self.max_queue_age_secs == 0 {
            return Err("max_queue_age_secs must be greater than 0".into());
        }
        if self.store_retry_attempts == 0 {
            return Err("store_retry_attempts must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    /// Parse or validation failures.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `CHANGESET_SCHEDULER_*` environment variables,
    /// after loading a `.env` file if one is present.
    ///
    /// # Errors
    /// Unparseable values or a configuration that fails validation.
    pub fn from_env() -> AppResult<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by values from `lookup`, keyed by full variable name.
    ///
    /// # Errors
    /// Unparseable values or a configuration that fails validation.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        fn read<T>(
            lookup: &impl Fn(&str) -> Option<String>,
            field: &str,
            target: &mut T,
        ) -> AppResult<()>
        where
            T: std::str::FromStr,
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            let name = format!("{ENV_PREFIX}{}", field.to_ascii_uppercase());
            if let Some(raw) = lookup(&name) {
                *target = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid value for {name}: {raw:?}"))?;
            }
            Ok(())
        }

        let mut cfg = Self::default();
        read(&lookup, "max_concurrent_per_tenant", &mut cfg.max_concurrent_per_tenant)?;
        read(&lookup, "tick_interval_secs", &mut cfg.tick_interval_secs)?;
        read(&lookup, "stuck_check_interval_secs", &mut cfg.stuck_check_interval_secs)?;
        read(&lookup, "stuck_timeout_secs", &mut cfg.stuck_timeout_secs)?;
        read(&lookup, "max_queue_age_secs", &mut cfg.max_queue_age_secs)?;
        read(&lookup, "max_retry", &mut cfg.max_retry)?;
        read(&lookup, "log_throttle_secs", &mut cfg.log_throttle_secs)?;
        read(&lookup, "store_retry_attempts", &mut cfg.store_retry_attempts)?;
        read(&lookup, "store_retry_backoff_ms", &mut cfg.store_retry_backoff_ms)?;

        cfg.validate()
            .map_err(|e| anyhow::anyhow!("scheduler config invalid: {e}"))?;
        Ok(cfg)
    }

    /// Tick spacing.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Reaper spacing.
    #[must_use]
    pub const fn stuck_check_interval(&self) -> Duration {
        Duration::from_secs(self.stuck_check_interval_secs)
    }

    /// Staleness threshold for RUNNING change sets.
    #[must_use]
    pub const fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }

    /// Maximum QUEUED age.
    #[must_use]
    pub const fn max_queue_age(&self) -> Duration {
        Duration::from_secs(self.max_queue_age_secs)
    }

    /// Reaper settings derived from this configuration.
    #[must_use]
    pub const fn reaper_settings(&self) -> ReaperSettings {
        ReaperSettings {
            stuck_check_interval: self.stuck_check_interval(),
            stuck_timeout: self.stuck_timeout(),
            max_queue_age: self.max_queue_age(),
            max_retry: self.max_retry,
        }
    }

    /// Dispatcher loop settings derived from this configuration.
    #[must_use]
    pub const fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            tick_interval: self.tick_interval(),
            log_throttle: Duration::from_secs(self.log_throttle_secs),
        }
    }

    /// Store retry policy derived from this configuration.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.store_retry_attempts,
            backoff: Duration::from_millis(self.store_retry_backoff_ms),
        }
    }
}
