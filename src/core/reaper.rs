//! Stuck-job reaper.
//!
//! Runs at most once per check interval and makes two independent passes:
//!
//! 1. **Queue-age expiry**: QUEUED change sets older than the maximum queue
//!    age are SKIPPED with `MAX_QUEUE_DURATION_EXCEEDED`.
//! 2. **Stuck-run recovery**: RUNNING change sets whose last update is older
//!    than the stuck timeout are presumed orphaned by a dead worker. Per
//!    tenant they are re-queued with `retry_count + 1`, then any of the
//!    tenant's queued change sets over the retry ceiling are SKIPPED with
//!    `MAX_RETRY_COUNT_EXCEEDED` in the same pass, so a doomed change set is
//!    never admitted again.
//!
//! A failing pass, or a failing tenant inside the recovery pass, is logged and
//! recorded in the [`ReapReport`]; it never stops the other work.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::core::audit::{self, build_audit_event, AuditAction, SharedAuditSink};
use crate::core::model::{ChangeSetId, ChangeSetPayload, ChangeSetStatus, MessageCode, TenantId};
use crate::core::retry::{with_store_retry, RetryPolicy};
use crate::core::store::{ChangeSetFilter, ChangeSetStore, ChangeSetUpdate, GroupBy};
use crate::core::SchedulerError;
use crate::util::clock::Clock;

/// Timing and retry limits for the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperSettings {
    /// Minimum spacing between runs.
    pub stuck_check_interval: Duration,
    /// RUNNING change sets untouched for longer are recovered.
    pub stuck_timeout: Duration,
    /// QUEUED change sets enqueued longer ago are expired.
    pub max_queue_age: Duration,
    /// Recoveries allowed before a change set is given up on.
    pub max_retry: u32,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            stuck_check_interval: Duration::from_secs(30 * 60),
            stuck_timeout: Duration::from_secs(90 * 60),
            max_queue_age: Duration::from_secs(3 * 24 * 60 * 60),
            max_retry: 3,
        }
    }
}

/// Recovery result for one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantRecovery {
    /// Tenant whose change sets were recovered.
    pub tenant_id: TenantId,
    /// RUNNING -> QUEUED transitions.
    pub requeued: usize,
    /// QUEUED -> SKIPPED transitions for exhausted retries.
    pub exhausted: usize,
}

/// What one reaper run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Clock reading the run used.
    pub ran_at_ms: u128,
    /// QUEUED change sets expired for age.
    pub expired: usize,
    /// Per-tenant stuck-run recoveries.
    pub recovered: Vec<TenantRecovery>,
    /// Errors swallowed during the run.
    pub errors: Vec<String>,
}

impl ReapReport {
    /// Total change sets moved back to QUEUED.
    #[must_use]
    pub fn requeued_total(&self) -> usize {
        self.recovered.iter().map(|r| r.requeued).sum()
    }

    /// Total change sets given up on for exhausted retries.
    #[must_use]
    pub fn exhausted_total(&self) -> usize {
        self.recovered.iter().map(|r| r.exhausted).sum()
    }
}

/// Time-gated recovery of expired and orphaned change sets.
pub struct StuckJobReaper<P, S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    settings: ReaperSettings,
    retry: RetryPolicy,
    audit: Option<SharedAuditSink>,
    last_run_ms: Option<u128>,
    _payload: PhantomData<fn() -> P>,
}

impl<P, S> StuckJobReaper<P, S>
where
    P: ChangeSetPayload,
    S: ChangeSetStore<P>,
{
    /// Create a reaper. It is due immediately.
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, settings: ReaperSettings) -> Self {
        Self {
            store,
            clock,
            settings,
            retry: RetryPolicy::default(),
            audit: None,
            last_run_ms: None,
            _payload: PhantomData,
        }
    }

    /// Use a custom store retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: SharedAuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Active settings.
    #[must_use]
    pub const fn settings(&self) -> &ReaperSettings {
        &self.settings
    }

    /// When the reaper last started a run.
    #[must_use]
    pub const fn last_run_ms(&self) -> Option<u128> {
        self.last_run_ms
    }

    /// Whether a run is due at `now_ms`.
    #[must_use]
    pub fn is_due(&self, now_ms: u128) -> bool {
        self.last_run_ms.is_none_or(|last| {
            now_ms.saturating_sub(last) >= self.settings.stuck_check_interval.as_millis()
        })
    }

    /// Run both passes if the check interval has elapsed.
    pub async fn run_if_due(&mut self) -> Option<ReapReport> {
        let now = self.clock.now_ms();
        if !self.is_due(now) {
            return None;
        }
        Some(self.run(now).await)
    }

    /// Run both passes unconditionally at `now_ms`.
    ///
    /// The last-run mark is set before any store access, so a failing store
    /// is retried on the next interval rather than on every tick.
    pub async fn run(&mut self, now_ms: u128) -> ReapReport {
        self.last_run_ms = Some(now_ms);
        let mut report = ReapReport {
            ran_at_ms: now_ms,
            ..ReapReport::default()
        };

        match self.expire_queued(now_ms).await {
            Ok(expired) => report.expired = expired,
            Err(err) => {
                error!(error = %err, "queue-age expiry pass failed");
                report.errors.push(format!("expiry: {err}"));
            }
        }

        if let Err(err) = self.recover_stuck(now_ms, &mut report).await {
            error!(error = %err, "stuck-run recovery pass failed");
            report.errors.push(format!("recovery: {err}"));
        }

        debug!(
            expired = report.expired,
            requeued = report.requeued_total(),
            exhausted = report.exhausted_total(),
            errors = report.errors.len(),
            "reaper run finished"
        );
        report
    }

    /// Skip every QUEUED change set older than the maximum queue age.
    ///
    /// # Errors
    /// Store failures after retries.
    pub async fn expire_queued(&self, now_ms: u128) -> Result<usize, SchedulerError> {
        let cutoff = now_ms.saturating_sub(self.settings.max_queue_age.as_millis());
        let filter = &ChangeSetFilter::status(ChangeSetStatus::Queued).queued_before(cutoff);
        let update = &ChangeSetUpdate::transition(ChangeSetStatus::Skipped, now_ms)
            .with_message(MessageCode::MaxQueueDurationExceeded);

        let store = &*self.store;
        let expired = with_store_retry(self.retry, "expire_queued", move || {
            store.update_where(filter, update)
        })
        .await?;

        if expired > 0 {
            warn!(
                count = expired,
                max_queue_age_secs = self.settings.max_queue_age.as_secs(),
                "skipped change sets that exceeded the maximum queue duration"
            );
            audit::record(self.audit.as_ref(), || {
                build_audit_event(
                    None,
                    "*",
                    AuditAction::Expire,
                    expired,
                    Some(MessageCode::MaxQueueDurationExceeded),
                    now_ms,
                )
            });
        }
        Ok(expired)
    }

    /// Find stale RUNNING change sets and recover them tenant by tenant.
    async fn recover_stuck(
        &self,
        now_ms: u128,
        report: &mut ReapReport,
    ) -> Result<(), SchedulerError> {
        let store = &*self.store;

        let running_filter = &ChangeSetFilter::status(ChangeSetStatus::Running);
        let tenants: Vec<TenantId> = with_store_retry(self.retry, "running_tenants", move || {
            store.group_counts(running_filter, GroupBy::Tenant)
        })
        .await?
        .into_iter()
        .filter(|c| c.count > 0)
        .map(|c| c.tenant_id)
        .collect();
        if tenants.is_empty() {
            return Ok(());
        }

        let cutoff = now_ms.saturating_sub(self.settings.stuck_timeout.as_millis());
        let stale_filter = &ChangeSetFilter::status(ChangeSetStatus::Running)
            .tenants(tenants)
            .updated_before(cutoff);
        let stale = with_store_retry(self.retry, "find_stuck", move || store.find(stale_filter))
            .await?;

        let mut by_tenant: BTreeMap<TenantId, Vec<ChangeSetId>> = BTreeMap::new();
        for cs in stale {
            by_tenant.entry(cs.tenant_id).or_default().push(cs.id);
        }

        for (tenant_id, ids) in by_tenant {
            match self.recover_tenant(&tenant_id, ids, cutoff, now_ms).await {
                Ok(recovery) => report.recovered.push(recovery),
                Err(err) => {
                    error!(
                        tenant = %tenant_id,
                        error = %err,
                        "failed to recover stuck change sets"
                    );
                    report.errors.push(format!("tenant {tenant_id}: {err}"));
                }
            }
        }
        Ok(())
    }

    async fn recover_tenant(
        &self,
        tenant_id: &TenantId,
        ids: Vec<ChangeSetId>,
        cutoff_ms: u128,
        now_ms: u128,
    ) -> Result<TenantRecovery, SchedulerError> {
        let store = &*self.store;
        let stuck_count = ids.len();

        // Staleness is checked again: a heartbeat since the find keeps the run.
        let requeue_filter = &ChangeSetFilter::status(ChangeSetStatus::Running)
            .tenants(vec![tenant_id.clone()])
            .ids(ids)
            .updated_before(cutoff_ms);
        let requeue = &ChangeSetUpdate::transition(ChangeSetStatus::Queued, now_ms)
            .incrementing_retry();
        let requeued = with_store_retry(self.retry, "requeue_stuck", move || {
            store.update_where(requeue_filter, requeue)
        })
        .await?;

        let exhausted_filter = &ChangeSetFilter::status(ChangeSetStatus::Queued)
            .tenants(vec![tenant_id.clone()])
            .retry_count_above(self.settings.max_retry);
        let exhaust = &ChangeSetUpdate::transition(ChangeSetStatus::Skipped, now_ms)
            .with_message(MessageCode::MaxRetryCountExceeded);
        let exhausted = with_store_retry(self.retry, "skip_exhausted", move || {
            store.update_where(exhausted_filter, exhaust)
        })
        .await?;

        info!(
            tenant = %tenant_id,
            stuck = stuck_count,
            requeued,
            exhausted,
            max_retry = self.settings.max_retry,
            "recovered stuck change sets"
        );
        audit::record(self.audit.as_ref(), || {
            build_audit_event(None, tenant_id.clone(), AuditAction::Requeue, requeued, None, now_ms)
        });
        if exhausted > 0 {
            audit::record(self.audit.as_ref(), || {
                build_audit_event(
                    None,
                    tenant_id.clone(),
                    AuditAction::Exhaust,
                    exhausted,
                    Some(MessageCode::MaxRetryCountExceeded),
                    now_ms,
                )
            });
        }

        Ok(TenantRecovery {
            tenant_id: tenant_id.clone(),
            requeued,
            exhausted,
        })
    }
}
