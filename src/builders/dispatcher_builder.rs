//! Builders to construct a dispatcher from configuration.

use std::sync::Arc;

use tracing::warn;

use crate::config::SchedulerConfig;
use crate::core::{
    AdmissionController, ChangeSetPayload, ChangeSetStore, DelegateRegistry, Direction,
    Dispatcher, ProcessGate, SchedulerError, SharedAuditSink, StuckJobReaper,
};
use crate::util::clock::Clock;

/// Build a dispatcher, with its reaper and admission controller, from configuration.
///
/// # Errors
/// [`SchedulerError::Config`] when the configuration fails validation.
pub fn build_dispatcher<P, S>(
    cfg: &SchedulerConfig,
    store: Arc<S>,
    delegates: DelegateRegistry<P>,
    gate: Arc<dyn ProcessGate>,
    clock: Arc<dyn Clock>,
) -> Result<Dispatcher<P, S>, SchedulerError>
where
    P: ChangeSetPayload,
    S: ChangeSetStore<P>,
{
    build_dispatcher_with_audit(cfg, store, delegates, gate, clock, None)
}

/// Same as [`build_dispatcher`], mirroring scheduler decisions to `audit`.
///
/// # Errors
/// [`SchedulerError::Config`] when the configuration fails validation.
pub fn build_dispatcher_with_audit<P, S>(
    cfg: &SchedulerConfig,
    store: Arc<S>,
    delegates: DelegateRegistry<P>,
    gate: Arc<dyn ProcessGate>,
    clock: Arc<dyn Clock>,
    audit: Option<SharedAuditSink>,
) -> Result<Dispatcher<P, S>, SchedulerError>
where
    P: ChangeSetPayload,
    S: ChangeSetStore<P>,
{
    cfg.validate()
        .map_err(|e| SchedulerError::Config(format!("config invalid: {e}")))?;

    for direction in [Direction::Outbound, Direction::Inbound] {
        if delegates.get(direction).is_none() {
            warn!(%direction, "no execution delegate registered; claimed change sets will fail");
        }
    }

    let retry = cfg.retry_policy();
    let mut reaper =
        StuckJobReaper::new(Arc::clone(&store), Arc::clone(&clock), cfg.reaper_settings())
            .with_retry(retry);
    if let Some(sink) = &audit {
        reaper = reaper.with_audit(Arc::clone(sink));
    }

    let dispatcher = Dispatcher::new(
        store,
        AdmissionController::new(cfg.max_concurrent_per_tenant),
        reaper,
        delegates,
        gate,
        clock,
        cfg.dispatcher_settings(),
        retry,
    );
    Ok(match audit {
        Some(sink) => dispatcher.with_audit(sink),
        None => dispatcher,
    })
}
