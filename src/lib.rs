//! # Change-Set Scheduler
//!
//! A tenant-fair scheduler for change sets: batches of file mutations that must be
//! applied in order per logical stream, while many tenants share one worker process.
//!
//! The scheduler decides which pending change set may run next, how many may run
//! concurrently per tenant, and how to recover change sets whose worker silently died.
//! All coordination is expressed as conditional reads and writes against a shared
//! [`core::ChangeSetStore`]; no distributed lock is taken per tick.
//!
//! ## Core Problem Solved
//!
//! - **Fairness**: a per-tenant cap stops one busy tenant from starving the others
//! - **Ordering**: change sets sharing a queue key run one at a time, oldest first
//! - **Recovery**: change sets stuck in `RUNNING` are re-queued, then given up on
//! - **Backpressure**: ticks never overlap, so slow execution slows admission
//!
//! ## Key Components
//!
//! - **`GroupKeyAggregator`**: grouped counts of queued/running `(tenant, queue key)` pairs
//! - **`AdmissionController`**: turns counts plus the tenant cap into eligible groups
//! - **`StuckJobReaper`**: time-gated expiry of old queued items and stuck-run recovery
//! - **`Dispatcher`**: the leader-gated polling loop that claims and executes work
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use changeset_scheduler::builders::build_dispatcher;
//! use changeset_scheduler::config::SchedulerConfig;
//! use changeset_scheduler::core::{DelegateRegistry, Direction, SingleNodeGate};
//! use changeset_scheduler::infra::store::InMemoryChangeSetStore;
//! use changeset_scheduler::util::clock::SystemClock;
//!
//! let store = Arc::new(InMemoryChangeSetStore::new());
//! let delegates = DelegateRegistry::new()
//!     .with(Direction::Outbound, Arc::new(push_to_git))
//!     .with(Direction::Inbound, Arc::new(apply_to_entities));
//!
//! let dispatcher = build_dispatcher(
//!     &SchedulerConfig::from_env()?,
//!     store,
//!     delegates,
//!     Arc::new(SingleNodeGate),
//!     Arc::new(SystemClock),
//! )?;
//! let handle = changeset_scheduler::runtime::spawn_dispatcher(
//!     &tokio::runtime::Handle::current(),
//!     dispatcher,
//! );
//! // ...
//! handle.shutdown().await;
//! ```
//!
//! For complete examples, see:
//! - `tests/scheduler_scenarios_test.rs` - admission and serialization scenarios
//! - `tests/reaper_test.rs` - stuck-job recovery and queue-age expiry

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions: model, store contract, admission, reaper, dispatcher.
pub mod core;
/// Configuration models for the scheduler.
pub mod config;
/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Infrastructure adapters for change-set storage.
pub mod infra;
/// Runtime adapters and the producer/callback API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
