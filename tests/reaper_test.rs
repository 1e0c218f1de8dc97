//! Integration tests for stuck-job recovery and queue-age expiry
//!
//! Time is driven with a manual clock, so the 30-minute check interval,
//! 90-minute stuck timeout and 3-day queue age are exercised without sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use changeset_scheduler::builders::build_dispatcher;
use changeset_scheduler::config::SchedulerConfig;
use changeset_scheduler::core::{
    shared_sink, AuditAction, ChangeSet, ChangeSetFilter, ChangeSetId, ChangeSetStatus,
    ChangeSetStore, ChangeSetUpdate, DelegateOutcome, DelegateRegistry, Direction,
    ExecutionDelegate, FileChangeBatch, GroupBy, GroupCount, GroupKey, InMemoryAuditSink,
    MessageCode, ReaperSettings, SchedulerError, SingleNodeGate, StuckJobReaper, TickOutcome,
};
use changeset_scheduler::infra::store::InMemoryChangeSetStore;
use changeset_scheduler::util::clock::{Clock, ManualClock};

// ============================================================================
// HELPERS
// ============================================================================

const T0: u128 = 1_700_000_000_000;
const MINUTE: Duration = Duration::from_secs(60);

type Store = InMemoryChangeSetStore<FileChangeBatch>;

/// Accepts everything and never reports back, like a worker that died.
struct SilentDelegate;

#[async_trait]
impl ExecutionDelegate<FileChangeBatch> for SilentDelegate {
    async fn execute(
        &self,
        _change_set: ChangeSet<FileChangeBatch>,
    ) -> Result<DelegateOutcome, SchedulerError> {
        Ok(DelegateOutcome::Pending)
    }
}

fn settings(max_retry: u32) -> ReaperSettings {
    ReaperSettings {
        max_retry,
        ..ReaperSettings::default()
    }
}

fn reaper(
    store: &Arc<Store>,
    clock: &ManualClock,
    max_retry: u32,
) -> StuckJobReaper<FileChangeBatch, Store> {
    StuckJobReaper::new(Arc::clone(store), Arc::new(clock.clone()), settings(max_retry))
}

async fn queue(store: &Store, clock: &ManualClock, tenant: &str, key: &str) -> ChangeSetId {
    let cs = ChangeSet::queued(
        tenant,
        key,
        Direction::Outbound,
        FileChangeBatch::default(),
        clock.now_ms(),
    );
    let id = cs.id.clone();
    store.insert(cs).await.unwrap();
    id
}

/// Queue and immediately claim, leaving a RUNNING change set updated now.
async fn running(store: &Store, clock: &ManualClock, tenant: &str, key: &str) -> ChangeSetId {
    let id = queue(store, clock, tenant, key).await;
    let claimed = store
        .claim_oldest(&GroupKey::new(tenant, key), clock.now_ms())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, id);
    id
}

async fn fetch(store: &Store, id: &ChangeSetId) -> ChangeSet<FileChangeBatch> {
    store.get(id).await.unwrap().unwrap()
}

// ============================================================================
// STUCK-RUN RECOVERY
// ============================================================================

#[tokio::test]
async fn test_stalled_change_set_is_requeued_then_skipped() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(Store::new());
    let z = queue(&store, &clock, "acme", "repo/main").await;

    let cfg = SchedulerConfig {
        max_retry: 1,
        ..SchedulerConfig::default()
    };
    let delegates = DelegateRegistry::<FileChangeBatch>::new()
        .with(Direction::Outbound, Arc::new(SilentDelegate));
    let mut dispatcher = build_dispatcher(
        &cfg,
        Arc::clone(&store),
        delegates,
        Arc::new(SingleNodeGate),
        Arc::new(clock.clone()),
    )
    .unwrap();

    let TickOutcome::Completed(first) = dispatcher.tick().await else {
        panic!("first tick should complete");
    };
    assert_eq!(first.claimed, vec![z.clone()]);

    // First stall: recovered and re-admitted in the same tick.
    clock.advance(91 * MINUTE);
    let TickOutcome::Completed(second) = dispatcher.tick().await else {
        panic!("second tick should complete");
    };
    let reap = second.reap.expect("reaper due after 91 minutes");
    assert_eq!(reap.requeued_total(), 1);
    assert_eq!(reap.exhausted_total(), 0);
    assert_eq!(second.claimed, vec![z.clone()]);
    let cs = fetch(&store, &z).await;
    assert_eq!(cs.status, ChangeSetStatus::Running);
    assert_eq!(cs.retry_count, 1);

    // Second stall pushes retry_count past max_retry.
    clock.advance(91 * MINUTE);
    let TickOutcome::Completed(third) = dispatcher.tick().await else {
        panic!("third tick should complete");
    };
    let reap = third.reap.expect("reaper due again");
    assert_eq!(reap.requeued_total(), 1);
    assert_eq!(reap.exhausted_total(), 1);
    assert!(third.claimed.is_empty());

    let cs = fetch(&store, &z).await;
    assert_eq!(cs.status, ChangeSetStatus::Skipped);
    assert_eq!(cs.retry_count, 2);
    assert_eq!(cs.message_code, Some(MessageCode::MaxRetryCountExceeded));
}

#[tokio::test]
async fn test_recent_running_change_sets_are_left_alone() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(Store::new());
    let old = running(&store, &clock, "acme", "a").await;
    clock.advance(60 * MINUTE);
    let fresh = running(&store, &clock, "acme", "b").await;
    clock.advance(31 * MINUTE);

    let mut reaper = reaper(&store, &clock, 3);
    let report = reaper.run_if_due().await.unwrap();

    assert_eq!(report.requeued_total(), 1);
    assert_eq!(fetch(&store, &old).await.status, ChangeSetStatus::Queued);
    assert_eq!(fetch(&store, &fresh).await.status, ChangeSetStatus::Running);
}

#[tokio::test]
async fn test_heartbeat_keeps_long_run_alive() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(Store::new());
    let id = running(&store, &clock, "acme", "a").await;

    clock.advance(80 * MINUTE);
    let touched = store
        .update_where(
            &ChangeSetFilter::status(ChangeSetStatus::Running).ids(vec![id.clone()]),
            &ChangeSetUpdate::touch(clock.now_ms()),
        )
        .await
        .unwrap();
    assert_eq!(touched, 1);
    clock.advance(20 * MINUTE);

    let mut reaper = reaper(&store, &clock, 3);
    let report = reaper.run_if_due().await.unwrap();
    assert_eq!(report.requeued_total(), 0);
    assert_eq!(fetch(&store, &id).await.status, ChangeSetStatus::Running);
}

#[tokio::test]
async fn test_recovery_is_grouped_per_tenant() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(Store::new());
    running(&store, &clock, "acme", "a").await;
    running(&store, &clock, "acme", "b").await;
    running(&store, &clock, "globex", "a").await;
    clock.advance(91 * MINUTE);

    let sink = InMemoryAuditSink::new(16);
    let audit = sink.reader();
    let mut reaper = reaper(&store, &clock, 3).with_audit(shared_sink(sink));
    let report = reaper.run_if_due().await.unwrap();

    assert_eq!(report.recovered.len(), 2);
    let acme = report
        .recovered
        .iter()
        .find(|r| r.tenant_id == "acme")
        .unwrap();
    assert_eq!(acme.requeued, 2);
    assert_eq!(report.requeued_total(), 3);
    assert!(report.errors.is_empty());

    let requeues = audit.with_action(AuditAction::Requeue);
    assert_eq!(requeues.len(), 2);
    assert_eq!(requeues.iter().map(|e| e.affected).sum::<usize>(), 3);
}

#[tokio::test]
async fn test_exhausted_change_sets_never_come_back() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(Store::new());
    let id = running(&store, &clock, "acme", "a").await;
    clock.advance(91 * MINUTE);

    let mut reaper = reaper(&store, &clock, 0);
    let report = reaper.run_if_due().await.unwrap();
    assert_eq!(report.exhausted_total(), 1);
    assert_eq!(fetch(&store, &id).await.status, ChangeSetStatus::Skipped);

    clock.advance(91 * MINUTE);
    let report = reaper.run_if_due().await.unwrap();
    assert_eq!(report.requeued_total(), 0);
    let cs = fetch(&store, &id).await;
    assert_eq!(cs.status, ChangeSetStatus::Skipped);
    assert_eq!(cs.retry_count, 1);
}

// ============================================================================
// QUEUE-AGE EXPIRY
// ============================================================================

#[tokio::test]
async fn test_old_queued_change_sets_expire_once() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(Store::new());
    let stale = queue(&store, &clock, "acme", "a").await;
    let busy = running(&store, &clock, "acme", "b").await;
    clock.advance(Duration::from_secs(24 * 60 * 60));
    let recent = queue(&store, &clock, "acme", "c").await;
    clock.advance(Duration::from_secs(2 * 24 * 60 * 60) + Duration::from_millis(1));

    let reaper = reaper(&store, &clock, 3);
    assert_eq!(reaper.expire_queued(clock.now_ms()).await.unwrap(), 1);
    assert_eq!(reaper.expire_queued(clock.now_ms()).await.unwrap(), 0);

    let cs = fetch(&store, &stale).await;
    assert_eq!(cs.status, ChangeSetStatus::Skipped);
    assert_eq!(cs.message_code, Some(MessageCode::MaxQueueDurationExceeded));
    assert_eq!(fetch(&store, &recent).await.status, ChangeSetStatus::Queued);
    // Expiry only looks at QUEUED items.
    assert_eq!(fetch(&store, &busy).await.status, ChangeSetStatus::Running);
}

#[tokio::test]
async fn test_expiry_boundary_is_exclusive() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(Store::new());
    let id = queue(&store, &clock, "acme", "a").await;
    clock.advance(Duration::from_secs(3 * 24 * 60 * 60));

    let reaper = reaper(&store, &clock, 3);
    assert_eq!(reaper.expire_queued(clock.now_ms()).await.unwrap(), 0);
    assert_eq!(fetch(&store, &id).await.status, ChangeSetStatus::Queued);
}

// ============================================================================
// CADENCE AND FAILURE ISOLATION
// ============================================================================

#[tokio::test]
async fn test_runs_at_most_once_per_interval() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(Store::new());
    let mut reaper = reaper(&store, &clock, 3);

    assert!(reaper.is_due(clock.now_ms()));
    assert!(reaper.run_if_due().await.is_some());
    assert_eq!(reaper.last_run_ms(), Some(T0));

    clock.advance(29 * MINUTE);
    assert!(reaper.run_if_due().await.is_none());

    clock.advance(MINUTE);
    let report = reaper.run_if_due().await.unwrap();
    assert_eq!(report.ran_at_ms, T0 + 30 * 60 * 1000);
}

/// In-memory store with switchable faults around the reaper's calls.
#[derive(Default)]
struct FaultyStore {
    inner: Store,
    /// Grouped counts fail.
    broken_aggregation: AtomicBool,
    /// The queue-age expiry update fails.
    broken_expiry: AtomicBool,
    /// The stuck-run requeue fails for this tenant only.
    broken_requeue_tenant: Mutex<Option<String>>,
    /// Heartbeat every RUNNING change set at this instant right after a find.
    heartbeat_after_find: Mutex<Option<u128>>,
}

impl FaultyStore {
    fn is_expiry(filter: &ChangeSetFilter) -> bool {
        filter.statuses == [ChangeSetStatus::Queued] && filter.queued_before_ms.is_some()
    }

    fn is_requeue_of(filter: &ChangeSetFilter, update: &ChangeSetUpdate, tenant: &str) -> bool {
        update.status == Some(ChangeSetStatus::Queued)
            && filter.statuses == [ChangeSetStatus::Running]
            && filter.tenant_ids.as_deref() == Some(&[tenant.to_string()][..])
    }
}

#[async_trait]
impl ChangeSetStore<FileChangeBatch> for FaultyStore {
    async fn insert(&self, change_set: ChangeSet<FileChangeBatch>) -> Result<(), SchedulerError> {
        self.inner.insert(change_set).await
    }

    async fn get(
        &self,
        id: &ChangeSetId,
    ) -> Result<Option<ChangeSet<FileChangeBatch>>, SchedulerError> {
        self.inner.get(id).await
    }

    async fn find(
        &self,
        filter: &ChangeSetFilter,
    ) -> Result<Vec<ChangeSet<FileChangeBatch>>, SchedulerError> {
        let found = self.inner.find(filter).await?;
        let heartbeat = *self.heartbeat_after_find.lock();
        if let Some(at) = heartbeat {
            self.inner
                .update_where(
                    &ChangeSetFilter::status(ChangeSetStatus::Running),
                    &ChangeSetUpdate::touch(at),
                )
                .await?;
        }
        Ok(found)
    }

    async fn group_counts(
        &self,
        filter: &ChangeSetFilter,
        group_by: GroupBy,
    ) -> Result<Vec<GroupCount>, SchedulerError> {
        if self.broken_aggregation.load(Ordering::SeqCst) {
            return Err(SchedulerError::Store("aggregation unavailable".into()));
        }
        self.inner.group_counts(filter, group_by).await
    }

    async fn claim_oldest(
        &self,
        key: &GroupKey,
        now_ms: u128,
    ) -> Result<Option<ChangeSet<FileChangeBatch>>, SchedulerError> {
        self.inner.claim_oldest(key, now_ms).await
    }

    async fn update_where(
        &self,
        filter: &ChangeSetFilter,
        update: &ChangeSetUpdate,
    ) -> Result<usize, SchedulerError> {
        if self.broken_expiry.load(Ordering::SeqCst) && Self::is_expiry(filter) {
            return Err(SchedulerError::Store("expiry update rejected".into()));
        }
        let broken_tenant = self.broken_requeue_tenant.lock().clone();
        if let Some(tenant) = broken_tenant {
            if Self::is_requeue_of(filter, update, &tenant) {
                return Err(SchedulerError::Store(format!("requeue rejected for {tenant}")));
            }
        }
        self.inner.update_where(filter, update).await
    }
}

fn faulty_reaper(
    store: &Arc<FaultyStore>,
    clock: &ManualClock,
) -> StuckJobReaper<FileChangeBatch, FaultyStore> {
    StuckJobReaper::new(Arc::clone(store), Arc::new(clock.clone()), settings(3))
}

#[tokio::test]
async fn test_failed_recovery_pass_does_not_stop_expiry() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(FaultyStore::default());
    store.broken_aggregation.store(true, Ordering::SeqCst);
    let id = queue(&store.inner, &clock, "acme", "a").await;
    clock.advance(Duration::from_secs(4 * 24 * 60 * 60));

    let mut reaper = faulty_reaper(&store, &clock);
    let report = reaper.run_if_due().await.unwrap();

    assert_eq!(report.expired, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("recovery"));
    assert_eq!(fetch(&store.inner, &id).await.status, ChangeSetStatus::Skipped);
    // The failed run still counts; the next attempt waits a full interval.
    store.broken_aggregation.store(false, Ordering::SeqCst);
    assert!(reaper.run_if_due().await.is_none());
}

#[tokio::test]
async fn test_failed_expiry_pass_does_not_stop_recovery() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(FaultyStore::default());
    store.broken_expiry.store(true, Ordering::SeqCst);
    let waiting = queue(&store.inner, &clock, "acme", "a").await;
    let stuck = running(&store.inner, &clock, "acme", "b").await;
    clock.advance(Duration::from_secs(4 * 24 * 60 * 60));

    let mut reaper = faulty_reaper(&store, &clock);
    let report = reaper.run_if_due().await.unwrap();

    assert_eq!(report.expired, 0);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("expiry"));
    assert_eq!(report.requeued_total(), 1);
    assert_eq!(fetch(&store.inner, &waiting).await.status, ChangeSetStatus::Queued);
    let cs = fetch(&store.inner, &stuck).await;
    assert_eq!(cs.status, ChangeSetStatus::Queued);
    assert_eq!(cs.retry_count, 1);
}

#[tokio::test]
async fn test_failing_tenant_does_not_stop_other_tenants() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(FaultyStore::default());
    *store.broken_requeue_tenant.lock() = Some("acme".into());
    let acme = running(&store.inner, &clock, "acme", "a").await;
    let globex = running(&store.inner, &clock, "globex", "a").await;
    let initech = running(&store.inner, &clock, "initech", "a").await;
    clock.advance(91 * MINUTE);

    let mut reaper = faulty_reaper(&store, &clock);
    let report = reaper.run_if_due().await.unwrap();

    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("tenant acme"));
    let recovered: Vec<&str> = report.recovered.iter().map(|r| r.tenant_id.as_str()).collect();
    assert_eq!(recovered, vec!["globex", "initech"]);
    assert_eq!(report.requeued_total(), 2);

    assert_eq!(fetch(&store.inner, &acme).await.status, ChangeSetStatus::Running);
    assert_eq!(fetch(&store.inner, &globex).await.status, ChangeSetStatus::Queued);
    assert_eq!(fetch(&store.inner, &initech).await.status, ChangeSetStatus::Queued);
}

#[tokio::test]
async fn test_heartbeat_after_find_keeps_run() {
    let clock = ManualClock::new(T0);
    let store = Arc::new(FaultyStore::default());
    let id = running(&store.inner, &clock, "acme", "a").await;
    clock.advance(91 * MINUTE);
    // The worker reports in between the reaper's find and its requeue.
    *store.heartbeat_after_find.lock() = Some(clock.now_ms());

    let mut reaper = faulty_reaper(&store, &clock);
    let report = reaper.run_if_due().await.unwrap();

    assert!(report.errors.is_empty());
    assert_eq!(report.requeued_total(), 0);
    let cs = fetch(&store.inner, &id).await;
    assert_eq!(cs.status, ChangeSetStatus::Running);
    assert_eq!(cs.retry_count, 0);
    assert_eq!(cs.last_updated_at_ms, clock.now_ms());
}
