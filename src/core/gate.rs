//! Leadership and maintenance gating for the dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Why a tick may or may not proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// This process may schedule.
    Open,
    /// The process is in maintenance mode.
    Maintenance,
    /// Another instance holds leadership.
    NotLeader,
}

/// Injected process-level capability consulted before every tick.
///
/// Single-node deployments use [`SingleNodeGate`]; multi-node deployments
/// back `is_leader` with a lease and flip a [`SwitchGate`] from the lease
/// renewal task.
pub trait ProcessGate: Send + Sync {
    /// Whether this instance is the elected scheduler.
    fn is_leader(&self) -> bool;

    /// Whether the process is in maintenance mode.
    fn in_maintenance(&self) -> bool {
        false
    }

    /// Combined gate check; maintenance wins over leadership.
    fn state(&self) -> GateState {
        if self.in_maintenance() {
            GateState::Maintenance
        } else if self.is_leader() {
            GateState::Open
        } else {
            GateState::NotLeader
        }
    }
}

/// Always leader, never in maintenance.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleNodeGate;

impl ProcessGate for SingleNodeGate {
    fn is_leader(&self) -> bool {
        true
    }
}

/// Flag-backed gate; clones share the same flags.
#[derive(Debug, Clone)]
pub struct SwitchGate {
    leader: Arc<AtomicBool>,
    maintenance: Arc<AtomicBool>,
}

impl SwitchGate {
    /// Create a gate with initial leadership.
    #[must_use]
    pub fn new(leader: bool) -> Self {
        Self {
            leader: Arc::new(AtomicBool::new(leader)),
            maintenance: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Grant or revoke leadership.
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Release);
    }

    /// Enter or leave maintenance mode.
    pub fn set_maintenance(&self, maintenance: bool) {
        self.maintenance.store(maintenance, Ordering::Release);
    }
}

impl ProcessGate for SwitchGate {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    fn in_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Acquire)
    }
}
