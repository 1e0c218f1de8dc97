//! Core scheduling abstractions: model, store contract, admission, recovery and dispatch.

pub mod admission;
pub mod aggregator;
pub mod audit;
pub mod delegate;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod model;
pub mod reaper;
pub mod retry;
pub mod store;

pub use admission::{AdmissionController, AdmissionDecision, DEFAULT_MAX_CONCURRENT_PER_TENANT};
pub use aggregator::{GroupKeyAggregator, GroupSnapshot};
pub use audit::{
    build_audit_event, shared_sink, AuditAction, AuditEvent, AuditReader, AuditSink,
    InMemoryAuditSink, SharedAuditSink,
};
pub use delegate::{DelegateOutcome, DelegateRegistry, ExecutionDelegate};
pub use dispatcher::{
    Dispatcher, DispatcherCounters, DispatcherSettings, DispatcherStats, TickOutcome, TickReport,
};
pub use error::{AppResult, SchedulerError};
pub use gate::{GateState, ProcessGate, SingleNodeGate, SwitchGate};
pub use model::{
    ChangeSet, ChangeSetId, ChangeSetPayload, ChangeSetStatus, ChangeType, Direction, FileChange,
    FileChangeBatch, GroupKey, MessageCode, QueueKey, TenantId,
};
pub use reaper::{ReapReport, ReaperSettings, StuckJobReaper, TenantRecovery};
pub use retry::{with_store_retry, RetryPolicy};
pub use store::{ChangeSetFilter, ChangeSetStore, ChangeSetUpdate, GroupBy, GroupCount};
