//! File-backed change-set store.
//!
//! Documents live in memory and are rewritten to `<dir>/<stream>.jsonl`, one
//! JSON document per line in insertion order, after every mutation. A
//! mutation becomes visible only once its file image is written. On open
//! the file is replayed, so change sets survive a process restart: RUNNING
//! ones left behind by a crash are picked up by the reaper like any other
//! orphan. Suited to single-node deployments and local development.

use std::fs::{create_dir_all, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::model::{ChangeSet, ChangeSetId, ChangeSetPayload, GroupKey};
use crate::core::store::{ChangeSetFilter, ChangeSetStore, ChangeSetUpdate, GroupBy, GroupCount};
use crate::core::SchedulerError;
use crate::infra::store::memory::DocumentSet;

/// JSON-lines persisted change-set store.
pub struct JsonlChangeSetStore<P> {
    path: PathBuf,
    stream: String,
    docs: Mutex<DocumentSet<P>>,
}

impl<P: ChangeSetPayload> JsonlChangeSetStore<P> {
    /// Open (or create) the store for `stream` under `path`.
    ///
    /// # Errors
    /// I/O failures creating the directory or reading the file, and documents
    /// that fail to decode.
    pub fn open(path: impl AsRef<Path>, stream: impl Into<String>) -> Result<Self, SchedulerError> {
        let path = path.as_ref().to_path_buf();
        create_dir_all(&path).map_err(|e| SchedulerError::Store(e.to_string()))?;
        let store = Self {
            path,
            stream: stream.into(),
            docs: Mutex::new(DocumentSet::new()),
        };
        store.load_from_disk()?;
        Ok(store)
    }

    /// Location of the backing file.
    #[must_use]
    pub fn file_path(&self) -> PathBuf {
        self.path.join(format!("{}.jsonl", self.stream))
    }

    /// Number of stored change sets.
    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load_from_disk(&self) -> Result<(), SchedulerError> {
        let file_path = self.file_path();
        if !file_path.exists() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .open(&file_path)
            .map_err(|e| SchedulerError::Store(e.to_string()))?;
        let reader = BufReader::new(file);
        let mut docs = self.docs.lock();
        for line in reader.lines() {
            let line = line.map_err(|e| SchedulerError::Store(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let change_set: ChangeSet<P> = serde_json::from_str(&line)?;
            docs.insert(change_set)?;
        }
        tracing::debug!(
            path = %file_path.display(),
            count = docs.len(),
            "loaded change sets from disk"
        );
        Ok(())
    }

    fn rewrite_disk(&self, docs: &DocumentSet<P>) -> Result<(), SchedulerError> {
        let file_path = self.file_path();
        let tmp_path = file_path.with_extension("jsonl.tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(|e| SchedulerError::Store(e.to_string()))?;
            for change_set in docs.all() {
                let line = serde_json::to_string(&change_set)?;
                writeln!(file, "{line}").map_err(|e| SchedulerError::Store(e.to_string()))?;
            }
            file.sync_all()
                .map_err(|e| SchedulerError::Store(e.to_string()))?;
        }
        std::fs::rename(&tmp_path, &file_path).map_err(|e| SchedulerError::Store(e.to_string()))
    }

    /// Run a mutation against a copy of the documents and swap it in once the
    /// new image is on disk. A failed write leaves the store unchanged.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut DocumentSet<P>) -> Result<(T, bool), SchedulerError>,
    ) -> Result<T, SchedulerError> {
        let mut docs = self.docs.lock();
        let mut next = DocumentSet::clone(&docs);
        let (value, changed) = op(&mut next)?;
        if changed {
            self.rewrite_disk(&next)?;
            *docs = next;
        }
        Ok(value)
    }
}

#[async_trait]
impl<P: ChangeSetPayload> ChangeSetStore<P> for JsonlChangeSetStore<P> {
    async fn insert(&self, change_set: ChangeSet<P>) -> Result<(), SchedulerError> {
        self.mutate(|docs| docs.insert(change_set).map(|()| ((), true)))
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
        self.mutate(|docs| {
            let claimed = docs.claim_oldest(key, now_ms);
            let changed = claimed.is_some();
            Ok((claimed, changed))
        })
    }

    async fn update_where(
        &self,
        filter: &ChangeSetFilter,
        update: &ChangeSetUpdate,
    ) -> Result<usize, SchedulerError> {
        self.mutate(|docs| {
            let count = docs.update_where(filter, update)?;
            Ok((count, count > 0))
        })
    }
}
