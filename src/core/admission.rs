//! Per-tenant admission control.
//!
//! Two independent filters decide what may advance in a tick:
//!
//! - **Key level**: a group that already has a running change set is never
//!   admitted again, which serializes every queue key.
//! - **Tenant level**: a tenant at its concurrency cap gets nothing, and a
//!   tenant below it gets at most its remaining headroom, oldest groups first.
//!
//! Unrelated streams of a tenant keep flowing while one of its streams is busy.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::aggregator::GroupSnapshot;
use crate::core::model::{GroupKey, TenantId};

/// Default cap on concurrently running change sets per tenant.
pub const DEFAULT_MAX_CONCURRENT_PER_TENANT: usize = 5;

/// Outcome of one admission pass, kept whole for tick logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionDecision {
    /// Groups with queued work.
    pub queued_groups: BTreeSet<GroupKey>,
    /// Groups with running work.
    pub running_groups: BTreeSet<GroupKey>,
    /// Tenants at or above the cap.
    pub maxed_out_tenants: BTreeSet<TenantId>,
    /// Groups that may claim one change set this tick.
    pub eligible: BTreeSet<GroupKey>,
}

/// Combines grouped counts with the per-tenant cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionController {
    max_concurrent_per_tenant: usize,
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_PER_TENANT)
    }
}

impl AdmissionController {
    /// Create a controller with the given per-tenant cap.
    #[must_use]
    pub const fn new(max_concurrent_per_tenant: usize) -> Self {
        Self {
            max_concurrent_per_tenant,
        }
    }

    /// Configured per-tenant cap.
    #[must_use]
    pub const fn max_concurrent_per_tenant(&self) -> usize {
        self.max_concurrent_per_tenant
    }

    /// Tenants whose running count has reached the cap.
    #[must_use]
    pub fn maxed_out_tenants(
        &self,
        running_by_tenant: &BTreeMap<TenantId, usize>,
    ) -> BTreeSet<TenantId> {
        running_by_tenant
            .iter()
            .filter(|(_, &count)| count >= self.max_concurrent_per_tenant)
            .map(|(tenant, _)| tenant.clone())
            .collect()
    }

    /// Groups eligible to advance, given queued groups (with their oldest
    /// enqueue time), running groups and running counts per tenant.
    #[must_use]
    pub fn eligible(
        &self,
        queued: &BTreeMap<GroupKey, u128>,
        running: &BTreeSet<GroupKey>,
        running_by_tenant: &BTreeMap<TenantId, usize>,
    ) -> BTreeSet<GroupKey> {
        let maxed_out = self.maxed_out_tenants(running_by_tenant);

        let mut candidates: BTreeMap<&TenantId, Vec<(u128, &GroupKey)>> = BTreeMap::new();
        for (key, &oldest) in queued {
            if running.contains(key) || maxed_out.contains(&key.tenant_id) {
                continue;
            }
            candidates
                .entry(&key.tenant_id)
                .or_default()
                .push((oldest, key));
        }

        let mut eligible = BTreeSet::new();
        for (tenant, mut groups) in candidates {
            let running_now = running_by_tenant.get(tenant).copied().unwrap_or(0);
            let headroom = self.max_concurrent_per_tenant.saturating_sub(running_now);
            groups.sort();
            eligible.extend(groups.into_iter().take(headroom).map(|(_, key)| key.clone()));
        }
        eligible
    }

    /// Full decision over an aggregator snapshot.
    #[must_use]
    pub fn decide(&self, snapshot: &GroupSnapshot) -> AdmissionDecision {
        AdmissionDecision {
            queued_groups: snapshot.queued_groups(),
            running_groups: snapshot.running.clone(),
            maxed_out_tenants: self.maxed_out_tenants(&snapshot.running_by_tenant),
            eligible: self.eligible(
                &snapshot.queued,
                &snapshot.running,
                &snapshot.running_by_tenant,
            ),
        }
    }
}
