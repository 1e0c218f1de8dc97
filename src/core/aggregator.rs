//! Grouped views of queued and running change sets.

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::core::model::{ChangeSetPayload, ChangeSetStatus, GroupKey, TenantId};
use crate::core::retry::{with_store_retry, RetryPolicy};
use crate::core::store::{ChangeSetFilter, ChangeSetStore, GroupBy, GroupCount};
use crate::core::SchedulerError;

/// Point-in-time admission inputs read from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSnapshot {
    /// Groups with at least one QUEUED change set, mapped to their oldest `queued_on_ms`.
    pub queued: BTreeMap<GroupKey, u128>,
    /// Groups with at least one RUNNING change set.
    pub running: BTreeSet<GroupKey>,
    /// RUNNING change sets per tenant.
    pub running_by_tenant: BTreeMap<TenantId, usize>,
}

impl GroupSnapshot {
    /// Queued group keys without their ages.
    #[must_use]
    pub fn queued_groups(&self) -> BTreeSet<GroupKey> {
        self.queued.keys().cloned().collect()
    }
}

/// Computes distinct queued/running groups and per-tenant running counts.
///
/// Read-only: every method is a grouped count over the store. Errors
/// propagate so the caller can abandon the tick without partial admission.
pub struct GroupKeyAggregator<P, S> {
    store: Arc<S>,
    retry: RetryPolicy,
    _payload: PhantomData<fn() -> P>,
}

impl<P, S> GroupKeyAggregator<P, S>
where
    P: ChangeSetPayload,
    S: ChangeSetStore<P>,
{
    /// Create an aggregator over `store`.
    pub const fn new(store: Arc<S>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            _payload: PhantomData,
        }
    }

    async fn counts(
        &self,
        status: ChangeSetStatus,
        group_by: GroupBy,
    ) -> Result<Vec<GroupCount>, SchedulerError> {
        let filter = &ChangeSetFilter::status(status);
        let store = &*self.store;
        with_store_retry(self.retry, "group_counts", move || {
            store.group_counts(filter, group_by)
        })
        .await
    }

    /// Groups with queued work, with the oldest `queued_on_ms` per group.
    ///
    /// # Errors
    /// Store failures after retries.
    pub async fn queued_groups(&self) -> Result<BTreeMap<GroupKey, u128>, SchedulerError> {
        let counts = self
            .counts(ChangeSetStatus::Queued, GroupBy::TenantAndQueueKey)
            .await?;
        Ok(counts
            .into_iter()
            .filter(|c| c.count > 0)
            .filter_map(|c| {
                c.queue_key
                    .map(|key| (GroupKey::new(c.tenant_id, key), c.oldest_queued_on_ms))
            })
            .collect())
    }

    /// Groups with a running change set.
    ///
    /// # Errors
    /// Store failures after retries.
    pub async fn running_groups(&self) -> Result<BTreeSet<GroupKey>, SchedulerError> {
        let counts = self
            .counts(ChangeSetStatus::Running, GroupBy::TenantAndQueueKey)
            .await?;
        Ok(counts
            .into_iter()
            .filter(|c| c.count > 0)
            .filter_map(|c| c.queue_key.map(|key| GroupKey::new(c.tenant_id, key)))
            .collect())
    }

    /// Running change sets per tenant.
    ///
    /// # Errors
    /// Store failures after retries.
    pub async fn running_count_by_tenant(
        &self,
    ) -> Result<BTreeMap<TenantId, usize>, SchedulerError> {
        let counts = self
            .counts(ChangeSetStatus::Running, GroupBy::Tenant)
            .await?;
        Ok(counts
            .into_iter()
            .filter(|c| c.count > 0)
            .map(|c| (c.tenant_id, c.count))
            .collect())
    }

    /// All three views in one call.
    ///
    /// # Errors
    /// The first store failure; no partial snapshot is returned.
    pub async fn snapshot(&self) -> Result<GroupSnapshot, SchedulerError> {
        Ok(GroupSnapshot {
            queued: self.queued_groups().await?,
            running: self.running_groups().await?,
            running_by_tenant: self.running_count_by_tenant().await?,
        })
    }
}
