//! Execution delegates: the code that actually applies a change set.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::model::{ChangeSet, ChangeSetPayload, Direction, MessageCode};
use crate::core::SchedulerError;

/// What a delegate reports after being handed a claimed change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegateOutcome {
    /// Work finished; the dispatcher records COMPLETED.
    Completed {
        /// Optional reason code.
        message_code: Option<MessageCode>,
    },
    /// Work finished unsuccessfully; the dispatcher records FAILED.
    Failed {
        /// Optional reason code.
        message_code: Option<MessageCode>,
    },
    /// Work was handed off; the terminal status arrives later through the
    /// completion callback, and the change set stays RUNNING meanwhile.
    Pending,
}

/// Abstraction for executing a claimed change set.
///
/// Called inline from the dispatcher tick with no timeout. Long-running
/// delegates should heartbeat the change set so the reaper does not mistake
/// them for a dead worker.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use changeset_scheduler::core::{
///     ChangeSet, DelegateOutcome, ExecutionDelegate, FileChangeBatch, SchedulerError,
/// };
///
/// struct PushToGit;
///
/// #[async_trait]
/// impl ExecutionDelegate<FileChangeBatch> for PushToGit {
///     async fn execute(
///         &self,
///         cs: ChangeSet<FileChangeBatch>,
///     ) -> Result<DelegateOutcome, SchedulerError> {
///         commit_and_push(&cs.queue_key, &cs.payload).await?;
///         Ok(DelegateOutcome::Completed { message_code: None })
///     }
/// }
/// ```
#[async_trait]
pub trait ExecutionDelegate<P>: Send + Sync + 'static {
    /// Execute the change set.
    async fn execute(&self, change_set: ChangeSet<P>) -> Result<DelegateOutcome, SchedulerError>;
}

/// Delegates keyed by direction.
pub struct DelegateRegistry<P> {
    delegates: HashMap<Direction, Arc<dyn ExecutionDelegate<P>>>,
}

impl<P: ChangeSetPayload> Default for DelegateRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ChangeSetPayload> Clone for DelegateRegistry<P> {
    fn clone(&self) -> Self {
        Self {
            delegates: self.delegates.clone(),
        }
    }
}

impl<P: ChangeSetPayload> DelegateRegistry<P> {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            delegates: HashMap::new(),
        }
    }

    /// Register the delegate for a direction, replacing any previous one.
    #[must_use]
    pub fn with(mut self, direction: Direction, delegate: Arc<dyn ExecutionDelegate<P>>) -> Self {
        self.delegates.insert(direction, delegate);
        self
    }

    /// Delegate responsible for `direction`.
    #[must_use]
    pub fn get(&self, direction: Direction) -> Option<Arc<dyn ExecutionDelegate<P>>> {
        self.delegates.get(&direction).cloned()
    }

    /// Directions with a registered delegate.
    #[must_use]
    pub fn directions(&self) -> Vec<Direction> {
        let mut dirs: Vec<_> = self.delegates.keys().copied().collect();
        dirs.sort();
        dirs
    }
}
