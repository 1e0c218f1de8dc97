//! In-memory change-set store.
//!
//! Every operation runs under one `parking_lot::Mutex`, which makes claims and
//! bulk updates atomic the same way a document store's find-and-modify is.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::model::{ChangeSet, ChangeSetId, ChangeSetPayload, ChangeSetStatus, GroupKey};
use crate::core::store::{ChangeSetFilter, ChangeSetStore, ChangeSetUpdate, GroupBy, GroupCount};
use crate::core::SchedulerError;

#[derive(Clone)]
struct Entry<P> {
    /// Insertion order; breaks `queued_on_ms` ties.
    seq: u64,
    change_set: ChangeSet<P>,
}

/// Document set shared by the in-process backends.
#[derive(Clone)]
pub(crate) struct DocumentSet<P> {
    entries: HashMap<ChangeSetId, Entry<P>>,
    next_seq: u64,
}

impl<P: Clone> DocumentSet<P> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn insert(&mut self, change_set: ChangeSet<P>) -> Result<(), SchedulerError> {
        if self.entries.contains_key(&change_set.id) {
            return Err(SchedulerError::Store(format!(
                "duplicate change set id {}",
                change_set.id
            )));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(change_set.id.clone(), Entry { seq, change_set });
        Ok(())
    }

    pub(crate) fn get(&self, id: &ChangeSetId) -> Option<ChangeSet<P>> {
        self.entries.get(id).map(|e| e.change_set.clone())
    }

    fn ordered<'a>(&'a self, filter: &'a ChangeSetFilter) -> Vec<&'a Entry<P>> {
        let mut matched: Vec<&Entry<P>> = self
            .entries
            .values()
            .filter(|e| filter.matches(&e.change_set))
            .collect();
        matched.sort_by_key(|e| (e.change_set.queued_on_ms, e.seq));
        matched
    }

    pub(crate) fn find(&self, filter: &ChangeSetFilter) -> Vec<ChangeSet<P>> {
        self.ordered(filter)
            .into_iter()
            .map(|e| e.change_set.clone())
            .collect()
    }

    /// All documents in insertion order.
    pub(crate) fn all(&self) -> Vec<ChangeSet<P>> {
        let mut entries: Vec<&Entry<P>> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.change_set.clone()).collect()
    }

    pub(crate) fn group_counts(
        &self,
        filter: &ChangeSetFilter,
        group_by: GroupBy,
    ) -> Vec<GroupCount> {
        let mut buckets: BTreeMap<(String, Option<String>), (usize, u128)> = BTreeMap::new();
        for entry in self.entries.values() {
            let cs = &entry.change_set;
            if !filter.matches(cs) {
                continue;
            }
            let queue_key = match group_by {
                GroupBy::Tenant => None,
                GroupBy::TenantAndQueueKey => Some(cs.queue_key.clone()),
            };
            let bucket = buckets
                .entry((cs.tenant_id.clone(), queue_key))
                .or_insert((0, cs.queued_on_ms));
            bucket.0 += 1;
            bucket.1 = bucket.1.min(cs.queued_on_ms);
        }
        buckets
            .into_iter()
            .map(|((tenant_id, queue_key), (count, oldest))| GroupCount {
                tenant_id,
                queue_key,
                count,
                oldest_queued_on_ms: oldest,
            })
            .collect()
    }

    pub(crate) fn claim_oldest(&mut self, key: &GroupKey, now_ms: u128) -> Option<ChangeSet<P>> {
        let filter = ChangeSetFilter::status(ChangeSetStatus::Queued).group(key.clone());
        let id = self.ordered(&filter).first()?.change_set.id.clone();
        let entry = self.entries.get_mut(&id)?;
        ChangeSetUpdate::transition(ChangeSetStatus::Running, now_ms).apply(&mut entry.change_set);
        Some(entry.change_set.clone())
    }

    pub(crate) fn update_where(
        &mut self,
        filter: &ChangeSetFilter,
        update: &ChangeSetUpdate,
    ) -> Result<usize, SchedulerError> {
        let mut targets = Vec::new();
        for (id, entry) in &self.entries {
            if filter.matches(&entry.change_set) {
                update.validate(&entry.change_set)?;
                targets.push(id.clone());
            }
        }
        for id in &targets {
            if let Some(entry) = self.entries.get_mut(id) {
                update.apply(&mut entry.change_set);
            }
        }
        Ok(targets.len())
    }
}

/// Change-set store held entirely in process memory.
pub struct InMemoryChangeSetStore<P> {
    docs: Mutex<DocumentSet<P>>,
}

impl<P: Clone> Default for InMemoryChangeSetStore<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Clone> InMemoryChangeSetStore<P> {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(DocumentSet::new()),
        }
    }

    /// Number of stored change sets.
    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored change set in insertion order.
    pub fn all(&self) -> Vec<ChangeSet<P>> {
        self.docs.lock().all()
    }
}

#[async_trait]
impl<P: ChangeSetPayload> ChangeSetStore<P> for InMemoryChangeSetStore<P> {
    async fn insert(&self, change_set: ChangeSet<P>) -> Result<(), SchedulerError> {
        self.docs.lock().insert(change_set)
    }

    async fn get(&self, id: &ChangeSetId) -> Result<Option<ChangeSet<P>>, SchedulerError> {
        Ok(self.docs.lock().get(id))
    }

    async fn find(&self, filter: &ChangeSetFilter) -> Result<Vec<ChangeSet<P>>, SchedulerError> {
        Ok(self.docs.lock().find(filter))
    }

    async fn group_counts(
        &self,
        filter: &ChangeSetFilter,
        group_by: GroupBy,
    ) -> Result<Vec<GroupCount>, SchedulerError> {
        Ok(self.docs.lock().group_counts(filter, group_by))
    }

    async fn claim_oldest(
        &self,
        key: &GroupKey,
        now_ms: u128,
    ) -> Result<Option<ChangeSet<P>>, SchedulerError> {
        Ok(self.docs.lock().claim_oldest(key, now_ms))
    }

    async fn update_where(
        &self,
        filter: &ChangeSetFilter,
        update: &ChangeSetUpdate,
    ) -> Result<usize, SchedulerError> {
        self.docs.lock().update_where(filter, update)
    }
}
