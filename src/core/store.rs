//! Change-set store contract.
//!
//! The store is the only shared mutable resource of the scheduler. Fairness,
//! serialization and recovery are all expressed as the conditional reads and
//! writes below, so any backend offering grouped counts, an atomic
//! find-and-modify claim and a bulk conditional update can host it.

use async_trait::async_trait;

use crate::core::model::{
    ChangeSet, ChangeSetId, ChangeSetPayload, ChangeSetStatus, GroupKey, MessageCode, TenantId,
};
use crate::core::SchedulerError;

/// Conjunctive filter over change sets. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSetFilter {
    /// Status must be one of these (empty matches any status).
    pub statuses: Vec<ChangeSetStatus>,
    /// Restrict to these tenants.
    pub tenant_ids: Option<Vec<TenantId>>,
    /// Restrict to one group key.
    pub group_key: Option<GroupKey>,
    /// Restrict to these identifiers.
    pub ids: Option<Vec<ChangeSetId>>,
    /// `queued_on_ms` strictly before this instant.
    pub queued_before_ms: Option<u128>,
    /// `last_updated_at_ms` strictly before this instant.
    pub updated_before_ms: Option<u128>,
    /// `retry_count` strictly greater than this value.
    pub retry_count_above: Option<u32>,
}

impl ChangeSetFilter {
    /// Filter on a single status.
    #[must_use]
    pub fn status(status: ChangeSetStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Self::default()
        }
    }

    /// Restrict to the given tenants.
    #[must_use]
    pub fn tenants(mut self, tenant_ids: Vec<TenantId>) -> Self {
        self.tenant_ids = Some(tenant_ids);
        self
    }

    /// Restrict to a single group key.
    #[must_use]
    pub fn group(mut self, key: GroupKey) -> Self {
        self.group_key = Some(key);
        self
    }

    /// Restrict to the given identifiers.
    #[must_use]
    pub fn ids(mut self, ids: Vec<ChangeSetId>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Only change sets queued before `at_ms`.
    #[must_use]
    pub const fn queued_before(mut self, at_ms: u128) -> Self {
        self.queued_before_ms = Some(at_ms);
        self
    }

    /// Only change sets last touched before `at_ms`.
    #[must_use]
    pub const fn updated_before(mut self, at_ms: u128) -> Self {
        self.updated_before_ms = Some(at_ms);
        self
    }

    /// Only change sets whose retry count exceeds `count`.
    #[must_use]
    pub const fn retry_count_above(mut self, count: u32) -> Self {
        self.retry_count_above = Some(count);
        self
    }

    /// Evaluate the filter against a document. Used by in-process backends.
    #[must_use]
    pub fn matches<P>(&self, cs: &ChangeSet<P>) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&cs.status) {
            return false;
        }
        if let Some(tenants) = &self.tenant_ids {
            if !tenants.contains(&cs.tenant_id) {
                return false;
            }
        }
        if let Some(key) = &self.group_key {
            if key.tenant_id != cs.tenant_id || key.queue_key != cs.queue_key {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&cs.id) {
                return false;
            }
        }
        if self.queued_before_ms.is_some_and(|at| cs.queued_on_ms >= at) {
            return false;
        }
        if self.updated_before_ms.is_some_and(|at| cs.last_updated_at_ms >= at) {
            return false;
        }
        if self.retry_count_above.is_some_and(|n| cs.retry_count <= n) {
            return false;
        }
        true
    }
}

/// Fields a grouped count aggregates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    /// One bucket per tenant.
    Tenant,
    /// One bucket per `(tenant, queue key)`.
    TenantAndQueueKey,
}

/// One bucket of a grouped count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCount {
    /// Tenant of the bucket.
    pub tenant_id: TenantId,
    /// Queue key of the bucket; `None` when grouped by tenant only.
    pub queue_key: Option<String>,
    /// Matching documents in the bucket.
    pub count: usize,
    /// Smallest `queued_on_ms` among the bucket's documents.
    pub oldest_queued_on_ms: u128,
}

/// Mutation applied by [`ChangeSetStore::update_where`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSetUpdate {
    /// New status, or `None` to leave it (heartbeats).
    pub status: Option<ChangeSetStatus>,
    /// Reason code to record alongside the status.
    pub message_code: Option<MessageCode>,
    /// Add one to `retry_count`.
    pub increment_retry: bool,
    /// Value written to `last_updated_at_ms`.
    pub touched_at_ms: u128,
}

impl ChangeSetUpdate {
    /// Move to `status` at `now_ms`.
    #[must_use]
    pub const fn transition(status: ChangeSetStatus, now_ms: u128) -> Self {
        Self {
            status: Some(status),
            message_code: None,
            increment_retry: false,
            touched_at_ms: now_ms,
        }
    }

    /// Only refresh `last_updated_at_ms`.
    #[must_use]
    pub const fn touch(now_ms: u128) -> Self {
        Self {
            status: None,
            message_code: None,
            increment_retry: false,
            touched_at_ms: now_ms,
        }
    }

    /// Record a reason code.
    #[must_use]
    pub fn with_message(mut self, code: MessageCode) -> Self {
        self.message_code = Some(code);
        self
    }

    /// Also bump the retry counter.
    #[must_use]
    pub const fn incrementing_retry(mut self) -> Self {
        self.increment_retry = true;
        self
    }

    /// Check the update against the allowed lifecycle.
    ///
    /// # Errors
    /// `InvalidTransition` if the status change is not allowed.
    pub fn validate<P>(&self, cs: &ChangeSet<P>) -> Result<(), SchedulerError> {
        match self.status {
            Some(next) if !cs.status.can_transition_to(next) => {
                Err(SchedulerError::InvalidTransition {
                    id: cs.id.clone(),
                    from: cs.status,
                    to: next,
                })
            }
            _ => Ok(()),
        }
    }

    /// Apply the update in place. Call [`Self::validate`] first.
    pub fn apply<P>(&self, cs: &mut ChangeSet<P>) {
        if let Some(status) = self.status {
            cs.status = status;
        }
        if let Some(code) = &self.message_code {
            cs.message_code = Some(code.clone());
        }
        if self.increment_retry {
            cs.retry_count = cs.retry_count.saturating_add(1);
        }
        cs.last_updated_at_ms = self.touched_at_ms;
    }
}

/// Abstraction for change-set storage backends.
#[async_trait]
pub trait ChangeSetStore<P: ChangeSetPayload>: Send + Sync + 'static {
    /// Persist a new change set.
    async fn insert(&self, change_set: ChangeSet<P>) -> Result<(), SchedulerError>;

    /// Fetch one change set by id.
    async fn get(&self, id: &ChangeSetId) -> Result<Option<ChangeSet<P>>, SchedulerError>;

    /// All change sets matching the filter, oldest `queued_on_ms` first.
    async fn find(&self, filter: &ChangeSetFilter) -> Result<Vec<ChangeSet<P>>, SchedulerError>;

    /// Grouped count of matching change sets.
    async fn group_counts(
        &self,
        filter: &ChangeSetFilter,
        group_by: GroupBy,
    ) -> Result<Vec<GroupCount>, SchedulerError>;

    /// Atomically move the oldest QUEUED change set of `key` to RUNNING.
    ///
    /// Returns `None` when nothing was queued for the key, which is also what
    /// a racing claimer sees after losing the race.
    async fn claim_oldest(
        &self,
        key: &GroupKey,
        now_ms: u128,
    ) -> Result<Option<ChangeSet<P>>, SchedulerError>;

    /// Apply `update` to every matching change set, returning how many changed.
    ///
    /// All-or-nothing: if any match would make an invalid transition, nothing
    /// is written and `InvalidTransition` is returned.
    async fn update_where(
        &self,
        filter: &ChangeSetFilter,
        update: &ChangeSetUpdate,
    ) -> Result<usize, SchedulerError>;
}
