//! Change-set data model.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Owning tenant/account identifier.
pub type TenantId = String;

/// Logical ordered work stream within a tenant (e.g. one repository branch).
pub type QueueKey = String;

/// Opaque unique change-set identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSetId(String);

impl ChangeSetId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChangeSetId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ChangeSetId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ChangeSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeSetStatus {
    /// Waiting for admission.
    Queued,
    /// Claimed by a dispatcher and handed to a delegate.
    Running,
    /// Execution failed.
    Failed,
    /// Execution finished successfully.
    Completed,
    /// Given up on without running (too old, retries exhausted, superseded).
    Skipped,
}

impl ChangeSetStatus {
    /// Terminal statuses are never left again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Completed | Self::Skipped)
    }

    /// Whether `self -> next` is part of the allowed lifecycle.
    ///
    /// `QUEUED -> RUNNING`, `RUNNING -> {FAILED, COMPLETED, QUEUED}` and
    /// `QUEUED -> SKIPPED`. Everything else is rejected.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running | Self::Skipped)
                | (Self::Running, Self::Failed | Self::Completed | Self::Queued)
        )
    }

    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for ChangeSetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which execution flow a change set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Platform edits pushed out to the version-control system.
    Outbound,
    /// Version-control changes applied to the platform's entity store.
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outbound => f.write_str("outbound"),
            Self::Inbound => f.write_str("inbound"),
        }
    }
}

/// Reason code recorded on a change set when it reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageCode {
    /// Sat in the queue longer than the configured maximum age.
    MaxQueueDurationExceeded,
    /// Recovered from a stuck run more times than allowed.
    MaxRetryCountExceeded,
    /// The delegate returned an error or panicked.
    ExecutionError,
    /// A later full sync on the same queue key made this change set redundant.
    SupersededByFullSync,
    /// Free-form code reported by a delegate.
    Delegate(String),
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxQueueDurationExceeded => f.write_str("MAX_QUEUE_DURATION_EXCEEDED"),
            Self::MaxRetryCountExceeded => f.write_str("MAX_RETRY_COUNT_EXCEEDED"),
            Self::ExecutionError => f.write_str("EXECUTION_ERROR"),
            Self::SupersededByFullSync => f.write_str("SUPERSEDED_BY_FULL_SYNC"),
            Self::Delegate(code) => f.write_str(code),
        }
    }
}

/// Admission unit: a queue key scoped to its tenant. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Work stream within the tenant.
    pub queue_key: QueueKey,
}

impl GroupKey {
    /// Build a group key.
    pub fn new(tenant_id: impl Into<TenantId>, queue_key: impl Into<QueueKey>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            queue_key: queue_key.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.queue_key)
    }
}

/// Marker trait for change-set payloads.
///
/// The scheduler never looks inside a payload; it only needs to move it
/// between threads and persist it.
pub trait ChangeSetPayload: Send + Sync + Clone + Serialize + DeserializeOwned + 'static {}

/// Blanket implementation: any type meeting the requirements is a payload.
impl<T> ChangeSetPayload for T where
    T: Send + Sync + Clone + Serialize + DeserializeOwned + 'static
{
}

/// A schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "P: Serialize"))]
#[serde(bound(deserialize = "P: DeserializeOwned"))]
pub struct ChangeSet<P> {
    /// Unique identifier.
    pub id: ChangeSetId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Serialized work stream within the tenant.
    pub queue_key: QueueKey,
    /// Current lifecycle status.
    pub status: ChangeSetStatus,
    /// Execution flow selecting the delegate.
    pub direction: Direction,
    /// Number of recoveries from a stuck run.
    pub retry_count: u32,
    /// Enqueue time (ms since epoch); FIFO order within a group.
    pub queued_on_ms: u128,
    /// Last status change or heartbeat (ms since epoch); staleness signal.
    pub last_updated_at_ms: u128,
    /// Origin of a derived change set, informational only.
    pub parent_id: Option<ChangeSetId>,
    /// Terminal reason code.
    pub message_code: Option<MessageCode>,
    /// Work description, opaque to the scheduler.
    pub payload: P,
}

impl<P> ChangeSet<P> {
    /// A freshly queued change set.
    pub fn queued(
        tenant_id: impl Into<TenantId>,
        queue_key: impl Into<QueueKey>,
        direction: Direction,
        payload: P,
        now_ms: u128,
    ) -> Self {
        Self {
            id: ChangeSetId::generate(),
            tenant_id: tenant_id.into(),
            queue_key: queue_key.into(),
            status: ChangeSetStatus::Queued,
            direction,
            retry_count: 0,
            queued_on_ms: now_ms,
            last_updated_at_ms: now_ms,
            parent_id: None,
            message_code: None,
            payload,
        }
    }

    /// Override the generated identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<ChangeSetId>) -> Self {
        self.id = id.into();
        self
    }

    /// Link to an originating change set.
    #[must_use]
    pub fn with_parent(mut self, parent_id: ChangeSetId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// The `(tenant, queue key)` pair this change set is admitted under.
    #[must_use]
    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(self.tenant_id.clone(), self.queue_key.clone())
    }
}

/// Kind of file mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// New file.
    Add,
    /// Content change.
    Modify,
    /// File removal.
    Delete,
    /// Move from `old_path` to `path`.
    Rename,
}

/// One file mutation inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Repository-relative path.
    pub path: String,
    /// Mutation kind.
    pub change_type: ChangeType,
    /// New content for adds and modifies.
    pub content: Option<String>,
    /// Previous path for renames.
    pub old_path: Option<String>,
}

impl FileChange {
    /// Add or overwrite `path` with `content`.
    pub fn upsert(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            change_type: ChangeType::Modify,
            content: Some(content.into()),
            old_path: None,
        }
    }

    /// Delete `path`.
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            change_type: ChangeType::Delete,
            content: None,
            old_path: None,
        }
    }
}

/// Production payload: a batch of file mutations applied as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeBatch {
    /// Mutations in application order.
    pub changes: Vec<FileChange>,
    /// Push even when the remote head moved.
    pub force_push: bool,
    /// Optional commit message for outbound batches.
    pub commit_message: Option<String>,
}
