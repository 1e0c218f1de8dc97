//! The dispatcher tick loop.
//!
//! One tick:
//!
//! 1. **Gate**: skip entirely unless this process is the leader and not in
//!    maintenance (no store access at all on a skipped tick).
//! 2. **Reap**: run the [`StuckJobReaper`] if its interval elapsed.
//! 3. **Admit**: aggregate grouped counts and apply the [`AdmissionController`].
//! 4. **Claim**: atomically claim the oldest queued change set of each
//!    eligible group. A lost race is a harmless miss.
//! 5. **Execute**: hand each claimed change set to its direction's delegate,
//!    inline and in order.
//!
//! Ticks never overlap; a slow tick delays the next one, which is the
//! scheduler's only throttle besides the per-tenant cap. Nothing a tick does
//! can stop the loop: every failure is logged and the next tick starts fresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::core::admission::{AdmissionController, AdmissionDecision};
use crate::core::aggregator::GroupKeyAggregator;
use crate::core::audit::{self, build_audit_event, AuditAction, SharedAuditSink};
use crate::core::delegate::{DelegateOutcome, DelegateRegistry};
use crate::core::gate::{GateState, ProcessGate};
use crate::core::model::{
    ChangeSet, ChangeSetId, ChangeSetPayload, ChangeSetStatus, GroupKey, MessageCode, TenantId,
};
use crate::core::reaper::{ReapReport, StuckJobReaper};
use crate::core::retry::{with_store_retry, RetryPolicy};
use crate::core::store::{ChangeSetFilter, ChangeSetStore, ChangeSetUpdate};
use crate::core::SchedulerError;
use crate::util::clock::Clock;
use crate::util::throttle::LogThrottle;

/// Loop cadence and log throttling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherSettings {
    /// Fixed spacing between tick starts.
    pub tick_interval: Duration,
    /// Minimum spacing of repetitive log lines (gate skips, admission summaries).
    pub log_throttle: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            log_throttle: Duration::from_secs(5 * 60),
        }
    }
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The gate was closed; nothing was read or written.
    Skipped(GateState),
    /// Aggregation failed; nothing was claimed.
    Aborted(String),
    /// The tick ran to the end.
    Completed(TickReport),
}

/// What a completed tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Reaper run, if one was due.
    pub reap: Option<ReapReport>,
    /// Admission inputs and result.
    pub decision: AdmissionDecision,
    /// Change sets claimed this tick, in claim order.
    pub claimed: Vec<ChangeSetId>,
    /// Eligible groups whose claim found nothing.
    pub claim_misses: usize,
    /// Claims that failed with a store error.
    pub claim_errors: usize,
    /// Change sets a delegate completed.
    pub completed: usize,
    /// Change sets failed by a delegate outcome, error or panic.
    pub failed: usize,
    /// Change sets handed off and still running.
    pub pending: usize,
}

/// Cumulative dispatcher statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Ticks started.
    pub ticks: u64,
    /// Ticks skipped by the gate.
    pub skipped_ticks: u64,
    /// Ticks abandoned because aggregation failed.
    pub aborted_ticks: u64,
    /// Successful claims.
    pub claimed: u64,
    /// Claims that found nothing to claim.
    pub claim_misses: u64,
    /// Change sets moved to COMPLETED by the dispatcher.
    pub completed: u64,
    /// Change sets moved to FAILED by the dispatcher.
    pub failed: u64,
}

/// Lock-free counters shared with observers while the loop runs.
#[derive(Debug, Default)]
pub struct DispatcherCounters {
    ticks: AtomicU64,
    skipped_ticks: AtomicU64,
    aborted_ticks: AtomicU64,
    claimed: AtomicU64,
    claim_misses: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl DispatcherCounters {
    /// Current values.
    #[must_use]
    pub fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            aborted_ticks: self.aborted_ticks.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            claim_misses: self.claim_misses.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Leader-gated polling loop that admits, claims and executes change sets.
pub struct Dispatcher<P, S> {
    store: Arc<S>,
    aggregator: GroupKeyAggregator<P, S>,
    admission: AdmissionController,
    reaper: StuckJobReaper<P, S>,
    delegates: DelegateRegistry<P>,
    gate: Arc<dyn ProcessGate>,
    clock: Arc<dyn Clock>,
    settings: DispatcherSettings,
    retry: RetryPolicy,
    audit: Option<SharedAuditSink>,
    gate_log: LogThrottle,
    summary_log: LogThrottle,
    counters: Arc<DispatcherCounters>,
}

impl<P, S> Dispatcher<P, S>
where
    P: ChangeSetPayload,
    S: ChangeSetStore<P>,
{
    /// Assemble a dispatcher from its parts.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        admission: AdmissionController,
        reaper: StuckJobReaper<P, S>,
        delegates: DelegateRegistry<P>,
        gate: Arc<dyn ProcessGate>,
        clock: Arc<dyn Clock>,
        settings: DispatcherSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            aggregator: GroupKeyAggregator::new(Arc::clone(&store), retry),
            store,
            admission,
            reaper,
            delegates,
            gate,
            clock,
            settings,
            retry,
            audit: None,
            gate_log: LogThrottle::new(settings.log_throttle),
            summary_log: LogThrottle::new(settings.log_throttle),
            counters: Arc::new(DispatcherCounters::default()),
        }
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: SharedAuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Loop settings.
    #[must_use]
    pub const fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Handle to the live counters.
    #[must_use]
    pub fn counters(&self) -> Arc<DispatcherCounters> {
        Arc::clone(&self.counters)
    }

    /// Snapshot of the cumulative counters.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot()
    }

    /// The reaper owned by this dispatcher.
    #[must_use]
    pub const fn reaper(&self) -> &StuckJobReaper<P, S> {
        &self.reaper
    }

    /// Run ticks on a fixed interval until `shutdown` becomes true or its
    /// sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let tick_interval_ms =
            u64::try_from(self.settings.tick_interval.as_millis()).unwrap_or(u64::MAX);
        info!(
            tick_interval_ms,
            max_concurrent_per_tenant = self.admission.max_concurrent_per_tenant(),
            "change-set dispatcher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("change-set dispatcher stopped");
    }

    /// Run a single tick.
    pub async fn tick(&mut self) -> TickOutcome {
        DispatcherCounters::bump(&self.counters.ticks, 1);
        let now = self.clock.now_ms();

        let gate = self.gate.state();
        if gate != GateState::Open {
            DispatcherCounters::bump(&self.counters.skipped_ticks, 1);
            if self.gate_log.should_log(now) {
                info!(state = ?gate, "scheduler tick skipped");
            }
            return TickOutcome::Skipped(gate);
        }

        let reap = self.reaper.run_if_due().await;

        let snapshot = match self.aggregator.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                DispatcherCounters::bump(&self.counters.aborted_ticks, 1);
                error!(error = %err, "failed to aggregate change-set groups, abandoning tick");
                return TickOutcome::Aborted(err.to_string());
            }
        };
        let decision = self.admission.decide(&snapshot);
        self.log_decision(&decision, now);

        let mut report = TickReport {
            reap,
            ..TickReport::default()
        };
        let mut claimed = Vec::with_capacity(decision.eligible.len());
        for key in &decision.eligible {
            match self.claim(key).await {
                Ok(Some(cs)) => {
                    report.claimed.push(cs.id.clone());
                    claimed.push(cs);
                }
                Ok(None) => {
                    debug!(group = %key, "claim missed, group drained or claimed elsewhere");
                    report.claim_misses += 1;
                }
                Err(err) => {
                    error!(group = %key, error = %err, "failed to claim change set");
                    report.claim_errors += 1;
                }
            }
        }
        DispatcherCounters::bump(&self.counters.claimed, report.claimed.len() as u64);
        DispatcherCounters::bump(&self.counters.claim_misses, report.claim_misses as u64);

        for cs in claimed {
            self.execute(cs, &mut report).await;
        }

        report.decision = decision;
        TickOutcome::Completed(report)
    }

    fn log_decision(&mut self, decision: &AdmissionDecision, now: u128) {
        let fmt_keys = |keys: &std::collections::BTreeSet<GroupKey>| {
            keys.iter().map(ToString::to_string).collect::<Vec<_>>()
        };
        if self.summary_log.should_log(now) {
            info!(
                queued_groups = ?fmt_keys(&decision.queued_groups),
                running_groups = ?fmt_keys(&decision.running_groups),
                maxed_out_tenants = ?decision.maxed_out_tenants,
                eligible = ?fmt_keys(&decision.eligible),
                "change-set admission"
            );
        } else {
            debug!(
                queued_groups = decision.queued_groups.len(),
                running_groups = decision.running_groups.len(),
                maxed_out_tenants = decision.maxed_out_tenants.len(),
                eligible = decision.eligible.len(),
                "change-set admission"
            );
        }
    }

    async fn claim(&self, key: &GroupKey) -> Result<Option<ChangeSet<P>>, SchedulerError> {
        let now = self.clock.now_ms();
        let store = &*self.store;
        let claimed = with_store_retry(self.retry, "claim_oldest", move || {
            store.claim_oldest(key, now)
        })
        .await?;

        if let Some(cs) = &claimed {
            debug!(
                tenant = %cs.tenant_id,
                queue_key = %cs.queue_key,
                change_set = %cs.id,
                retry_count = cs.retry_count,
                "claimed change set"
            );
            audit::record(self.audit.as_ref(), || {
                build_audit_event(
                    Some(cs.id.clone()),
                    cs.tenant_id.clone(),
                    AuditAction::Claim,
                    1,
                    None,
                    now,
                )
            });
        }
        Ok(claimed)
    }

    async fn execute(&self, cs: ChangeSet<P>, report: &mut TickReport) {
        let id = cs.id.clone();
        let tenant = cs.tenant_id.clone();
        let direction = cs.direction;

        let Some(delegate) = self.delegates.get(direction) else {
            error!(
                tenant = %tenant,
                change_set = %id,
                %direction,
                "no delegate registered for direction"
            );
            self.fail_execution(&id, &tenant, report).await;
            return;
        };

        // A panicking delegate surfaces as a JoinError instead of unwinding the loop.
        let joined = tokio::spawn(async move { delegate.execute(cs).await }).await;

        match joined {
            Ok(Ok(DelegateOutcome::Completed { message_code })) => {
                self.finish(&id, &tenant, ChangeSetStatus::Completed, message_code, report)
                    .await;
            }
            Ok(Ok(DelegateOutcome::Failed { message_code })) => {
                warn!(
                    tenant = %tenant,
                    change_set = %id,
                    %direction,
                    code = ?message_code,
                    "delegate reported failure"
                );
                self.finish(&id, &tenant, ChangeSetStatus::Failed, message_code, report)
                    .await;
            }
            Ok(Ok(DelegateOutcome::Pending)) => {
                debug!(
                    tenant = %tenant,
                    change_set = %id,
                    %direction,
                    "change set handed off, awaiting callback"
                );
                report.pending += 1;
            }
            Ok(Err(err)) => {
                error!(
                    tenant = %tenant,
                    change_set = %id,
                    %direction,
                    error = %err,
                    "delegate execution failed"
                );
                self.fail_execution(&id, &tenant, report).await;
            }
            Err(join_err) => {
                error!(
                    tenant = %tenant,
                    change_set = %id,
                    %direction,
                    error = %join_err,
                    "delegate panicked"
                );
                self.fail_execution(&id, &tenant, report).await;
            }
        }
    }

    async fn fail_execution(&self, id: &ChangeSetId, tenant: &TenantId, report: &mut TickReport) {
        self.finish(
            id,
            tenant,
            ChangeSetStatus::Failed,
            Some(MessageCode::ExecutionError),
            report,
        )
        .await;
    }

    /// Terminal transition with a RUNNING precondition. A miss means the
    /// change set was recovered or completed by a callback in the meantime.
    async fn finish(
        &self,
        id: &ChangeSetId,
        tenant: &TenantId,
        status: ChangeSetStatus,
        message_code: Option<MessageCode>,
        report: &mut TickReport,
    ) {
        let now = self.clock.now_ms();
        let filter = &ChangeSetFilter::status(ChangeSetStatus::Running).ids(vec![id.clone()]);
        let mut update = ChangeSetUpdate::transition(status, now);
        update.message_code.clone_from(&message_code);
        let update = &update;

        let store = &*self.store;
        match with_store_retry(self.retry, "finish_change_set", move || {
            store.update_where(filter, update)
        })
        .await
        {
            Ok(0) => {
                warn!(
                    tenant = %tenant,
                    change_set = %id,
                    %status,
                    "change set no longer running, outcome dropped"
                );
            }
            Ok(_) => {
                let action = if status == ChangeSetStatus::Completed {
                    report.completed += 1;
                    DispatcherCounters::bump(&self.counters.completed, 1);
                    AuditAction::Complete
                } else {
                    report.failed += 1;
                    DispatcherCounters::bump(&self.counters.failed, 1);
                    AuditAction::Fail
                };
                audit::record(self.audit.as_ref(), || {
                    build_audit_event(
                        Some(id.clone()),
                        tenant.clone(),
                        action,
                        1,
                        message_code,
                        now,
                    )
                });
            }
            Err(err) => {
                error!(
                    tenant = %tenant,
                    change_set = %id,
                    %status,
                    error = %err,
                    "failed to record change-set outcome"
                );
            }
        }
    }
}
