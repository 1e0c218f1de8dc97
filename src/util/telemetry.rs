//! Telemetry helpers for structured logging and tracing.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset: scheduler decisions at info, the
/// rest of the process at warn.
pub const DEFAULT_LOG_FILTER: &str = "warn,changeset_scheduler=info";

/// Install the env-filtered fmt subscriber unless one is already set.
///
/// Embedders that configure their own subscriber first are left alone.
pub fn init_tracing() {
    init_tracing_with(DEFAULT_LOG_FILTER);
}

/// Same as [`init_tracing`] with a custom fallback filter.
pub fn init_tracing_with(default_filter: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
