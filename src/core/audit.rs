//! Audit trail of scheduler decisions.
//!
//! Every status change the scheduler makes on its own authority (claims,
//! failures, expiries, recoveries) can be mirrored to an [`AuditSink`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::model::{ChangeSetId, MessageCode, TenantId};

/// Scheduler action recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    /// A new change set was accepted.
    Submit,
    /// QUEUED -> RUNNING by the dispatcher.
    Claim,
    /// RUNNING -> COMPLETED.
    Complete,
    /// RUNNING -> FAILED.
    Fail,
    /// QUEUED -> SKIPPED for queue age.
    Expire,
    /// RUNNING -> QUEUED by stuck-job recovery.
    Requeue,
    /// QUEUED -> SKIPPED after exhausting retries.
    Exhaust,
    /// QUEUED -> SKIPPED because a full sync replaced it.
    Supersede,
}

impl AuditAction {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Claim => "claim",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::Expire => "expire",
            Self::Requeue => "requeue",
            Self::Exhaust => "exhaust",
            Self::Supersede => "supersede",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// Change set concerned, or `None` for bulk actions.
    pub change_set_id: Option<ChangeSetId>,
    /// Tenant concerned.
    pub tenant_id: TenantId,
    /// Action taken.
    pub action: AuditAction,
    /// Number of change sets affected (bulk actions report > 1).
    pub affected: usize,
    /// Reason code, if any.
    pub message_code: Option<MessageCode>,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// Shared handle to an audit sink, as held by scheduler components.
pub type SharedAuditSink = Arc<Mutex<Box<dyn AuditSink>>>;

/// Wrap a sink for sharing between the dispatcher, reaper and service.
#[must_use]
pub fn shared_sink(sink: impl AuditSink + 'static) -> SharedAuditSink {
    Arc::new(Mutex::new(Box::new(sink)))
}

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events.min(1024)))),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// A reader sharing this sink's buffer, usable after the sink is boxed.
    #[must_use]
    pub fn reader(&self) -> AuditReader {
        AuditReader {
            events: Arc::clone(&self.events),
        }
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Read side of an [`InMemoryAuditSink`].
#[derive(Clone)]
pub struct AuditReader {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
}

impl AuditReader {
    /// Snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events with the given action.
    #[must_use]
    pub fn with_action(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    change_set_id: Option<ChangeSetId>,
    tenant_id: impl Into<TenantId>,
    action: AuditAction,
    affected: usize,
    message_code: Option<MessageCode>,
    now_ms: u128,
) -> AuditEvent {
    AuditEvent {
        change_set_id,
        tenant_id: tenant_id.into(),
        action,
        affected,
        message_code,
        created_at_ms: now_ms,
    }
}

/// Record into an optional sink.
pub(crate) fn record(sink: Option<&SharedAuditSink>, event: impl FnOnce() -> AuditEvent) {
    if let Some(sink) = sink {
        sink.lock().record(event());
    }
}
