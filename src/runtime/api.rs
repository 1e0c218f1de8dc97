//! Producer and callback surface: submissions, completion callbacks,
//! heartbeats and status lookups.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::audit::{self, build_audit_event, AuditAction, SharedAuditSink};
use crate::core::model::{
    ChangeSet, ChangeSetId, ChangeSetPayload, ChangeSetStatus, Direction, GroupKey, MessageCode,
    QueueKey, TenantId,
};
use crate::core::retry::{with_store_retry, RetryPolicy};
use crate::core::store::{ChangeSetFilter, ChangeSetStore, ChangeSetUpdate, GroupBy};
use crate::core::SchedulerError;
use crate::util::clock::Clock;

/// Change-set submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "P: Serialize"))]
#[serde(bound(deserialize = "P: serde::de::DeserializeOwned"))]
pub struct ChangeSetSubmission<P> {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Ordered stream within the tenant.
    pub queue_key: QueueKey,
    /// Flow selecting the delegate.
    pub direction: Direction,
    /// Opaque work description.
    pub payload: P,
    /// Optional origin link.
    #[serde(default)]
    pub parent_id: Option<ChangeSetId>,
    /// A full sync replaces everything still queued on the same queue key.
    #[serde(default)]
    pub full_sync: bool,
}

impl<P> ChangeSetSubmission<P> {
    /// A plain submission with no parent that supersedes nothing.
    pub fn new(
        tenant_id: impl Into<TenantId>,
        queue_key: impl Into<QueueKey>,
        direction: Direction,
        payload: P,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            queue_key: queue_key.into(),
            direction,
            payload,
            parent_id: None,
            full_sync: false,
        }
    }

    /// Mark the submission as a full sync.
    #[must_use]
    pub fn full_sync(mut self) -> Self {
        self.full_sync = true;
        self
    }

    /// Link to an originating change set.
    #[must_use]
    pub fn with_parent(mut self, parent_id: ChangeSetId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    /// Identifier of the new change set.
    pub id: ChangeSetId,
    /// Queued change sets skipped because this submission was a full sync.
    pub superseded: usize,
}

/// Change-set status response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetStatusResponse {
    /// Change-set identifier.
    pub id: ChangeSetId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Ordered stream within the tenant.
    pub queue_key: QueueKey,
    /// Current status.
    pub status: ChangeSetStatus,
    /// Stuck-run recoveries so far.
    pub retry_count: u32,
    /// Terminal reason, if any.
    pub message_code: Option<MessageCode>,
    /// Last status change or heartbeat (ms since epoch).
    pub last_updated_at_ms: u128,
}

impl<P> From<&ChangeSet<P>> for ChangeSetStatusResponse {
    fn from(cs: &ChangeSet<P>) -> Self {
        Self {
            id: cs.id.clone(),
            tenant_id: cs.tenant_id.clone(),
            queue_key: cs.queue_key.clone(),
            status: cs.status,
            retry_count: cs.retry_count,
            message_code: cs.message_code.clone(),
            last_updated_at_ms: cs.last_updated_at_ms,
        }
    }
}

/// Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag: the store answered.
    pub ok: bool,
    /// Change sets waiting to run.
    pub queued: usize,
    /// Change sets currently running.
    pub running: usize,
    /// Store error when unhealthy.
    pub error: Option<String>,
}

/// Store-backed API used by producers and by delegates reporting back.
pub struct ChangeSetService<P, S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    audit: Option<SharedAuditSink>,
    _payload: PhantomData<fn() -> P>,
}

impl<P, S> Clone for ChangeSetService<P, S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            retry: self.retry,
            audit: self.audit.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P, S> ChangeSetService<P, S>
where
    P: ChangeSetPayload,
    S: ChangeSetStore<P>,
{
    /// Create a service over `store`.
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retry: RetryPolicy::default(),
            audit: None,
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

    /// Queue a new change set.
    ///
    /// A full-sync submission first skips every change set still QUEUED on
    /// the same group key; RUNNING ones are left alone.
    ///
    /// # Errors
    /// `InvalidSubmission` for an empty tenant or queue key, store failures
    /// otherwise.
    pub async fn submit(
        &self,
        req: ChangeSetSubmission<P>,
    ) -> Result<SubmitReceipt, SchedulerError> {
        if req.tenant_id.trim().is_empty() {
            return Err(SchedulerError::InvalidSubmission("tenant_id is empty".into()));
        }
        if req.queue_key.trim().is_empty() {
            return Err(SchedulerError::InvalidSubmission("queue_key is empty".into()));
        }

        let now = self.clock.now_ms();
        let store = &*self.store;
        let key = GroupKey::new(req.tenant_id.clone(), req.queue_key.clone());

        let superseded = if req.full_sync {
            let filter = &ChangeSetFilter::status(ChangeSetStatus::Queued).group(key.clone());
            let update = &ChangeSetUpdate::transition(ChangeSetStatus::Skipped, now)
                .with_message(MessageCode::SupersededByFullSync);
            let skipped = with_store_retry(self.retry, "supersede_queued", move || {
                store.update_where(filter, update)
            })
            .await?;
            if skipped > 0 {
                info!(group = %key, count = skipped, "skipped queued change sets before full sync");
                audit::record(self.audit.as_ref(), || {
                    build_audit_event(
                        None,
                        key.tenant_id.clone(),
                        AuditAction::Supersede,
                        skipped,
                        Some(MessageCode::SupersededByFullSync),
                        now,
                    )
                });
            }
            skipped
        } else {
            0
        };

        let mut change_set = ChangeSet::queued(
            req.tenant_id,
            req.queue_key,
            req.direction,
            req.payload,
            now,
        );
        if let Some(parent) = req.parent_id {
            change_set = change_set.with_parent(parent);
        }
        let id = change_set.id.clone();
        let tenant = change_set.tenant_id.clone();

        // Not retried: a timed-out insert may have landed.
        store.insert(change_set).await?;
        debug!(tenant = %tenant, change_set = %id, group = %key, "change set queued");
        audit::record(self.audit.as_ref(), || {
            build_audit_event(Some(id.clone()), tenant, AuditAction::Submit, 1, None, now)
        });

        Ok(SubmitReceipt { id, superseded })
    }

    /// Completion callback for delegates that returned `Pending`.
    ///
    /// Returns `false` when the change set was no longer RUNNING, i.e. the
    /// reaper or another callback got there first.
    ///
    /// # Errors
    /// `InvalidTransition` when `status` is not COMPLETED or FAILED,
    /// `NotFound` for an unknown id, store failures otherwise.
    pub async fn complete(
        &self,
        id: &ChangeSetId,
        status: ChangeSetStatus,
        message_code: Option<MessageCode>,
    ) -> Result<bool, SchedulerError> {
        if !matches!(status, ChangeSetStatus::Completed | ChangeSetStatus::Failed) {
            return Err(SchedulerError::InvalidTransition {
                id: id.clone(),
                from: ChangeSetStatus::Running,
                to: status,
            });
        }
        let current = self.fetch(id).await?;

        let now = self.clock.now_ms();
        let filter = &ChangeSetFilter::status(ChangeSetStatus::Running).ids(vec![id.clone()]);
        let mut update = ChangeSetUpdate::transition(status, now);
        update.message_code.clone_from(&message_code);
        let update = &update;
        let store = &*self.store;
        let updated = with_store_retry(self.retry, "complete_change_set", move || {
            store.update_where(filter, update)
        })
        .await?;

        if updated == 0 {
            warn!(
                tenant = %current.tenant_id,
                change_set = %id,
                current = %current.status,
                requested = %status,
                "completion callback ignored, change set not running"
            );
            return Ok(false);
        }

        let action = if status == ChangeSetStatus::Completed {
            AuditAction::Complete
        } else {
            AuditAction::Fail
        };
        audit::record(self.audit.as_ref(), || {
            build_audit_event(
                Some(id.clone()),
                current.tenant_id.clone(),
                action,
                1,
                message_code,
                now,
            )
        });
        Ok(true)
    }

    /// Refresh `last_updated_at` of a RUNNING change set so the reaper keeps
    /// its hands off. Returns `false` when it is not running.
    ///
    /// # Errors
    /// Store failures after retries.
    pub async fn heartbeat(&self, id: &ChangeSetId) -> Result<bool, SchedulerError> {
        let now = self.clock.now_ms();
        let filter = &ChangeSetFilter::status(ChangeSetStatus::Running).ids(vec![id.clone()]);
        let update = &ChangeSetUpdate::touch(now);
        let store = &*self.store;
        let touched = with_store_retry(self.retry, "heartbeat", move || {
            store.update_where(filter, update)
        })
        .await?;
        Ok(touched > 0)
    }

    /// Current status of a change set.
    ///
    /// # Errors
    /// `NotFound` for an unknown id, store failures otherwise.
    pub async fn status(
        &self,
        id: &ChangeSetId,
    ) -> Result<ChangeSetStatusResponse, SchedulerError> {
        let cs = self.fetch(id).await?;
        Ok(ChangeSetStatusResponse::from(&cs))
    }

    /// Store reachability plus queued and running totals.
    pub async fn health(&self) -> Health {
        match self.totals().await {
            Ok((queued, running)) => Health {
                ok: true,
                queued,
                running,
                error: None,
            },
            Err(err) => Health {
                ok: false,
                queued: 0,
                running: 0,
                error: Some(err.to_string()),
            },
        }
    }

    async fn totals(&self) -> Result<(usize, usize), SchedulerError> {
        let store = &*self.store;
        let queued_filter = &ChangeSetFilter::status(ChangeSetStatus::Queued);
        let running_filter = &ChangeSetFilter::status(ChangeSetStatus::Running);
        let queued = with_store_retry(self.retry, "health_queued", move || {
            store.group_counts(queued_filter, GroupBy::Tenant)
        })
        .await?;
        let running = with_store_retry(self.retry, "health_running", move || {
            store.group_counts(running_filter, GroupBy::Tenant)
        })
        .await?;
        Ok((
            queued.iter().map(|c| c.count).sum(),
            running.iter().map(|c| c.count).sum(),
        ))
    }

    async fn fetch(&self, id: &ChangeSetId) -> Result<ChangeSet<P>, SchedulerError> {
        let store = &*self.store;
        with_store_retry(self.retry, "get_change_set", move || store.get(id))
            .await?
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))
    }
}
