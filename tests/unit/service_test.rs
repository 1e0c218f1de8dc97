//! Tests for the producer and callback API

use std::sync::Arc;
use std::time::Duration;

use changeset_scheduler::core::{
    shared_sink, AuditAction, ChangeSetId, ChangeSetStatus, ChangeSetStore, Direction,
    FileChange, FileChangeBatch, GroupKey, InMemoryAuditSink, MessageCode, SchedulerError,
};
use changeset_scheduler::infra::store::InMemoryChangeSetStore;
use changeset_scheduler::runtime::{ChangeSetService, ChangeSetSubmission};
use changeset_scheduler::util::{Clock, ManualClock};

type Store = InMemoryChangeSetStore<FileChangeBatch>;
type Service = ChangeSetService<FileChangeBatch, Store>;

fn service(clock: &ManualClock) -> (Arc<Store>, Service) {
    let store = Arc::new(Store::new());
    let service = ChangeSetService::new(Arc::clone(&store), Arc::new(clock.clone()));
    (store, service)
}

fn submission(queue_key: &str) -> ChangeSetSubmission<FileChangeBatch> {
    ChangeSetSubmission::new(
        "acme",
        queue_key,
        Direction::Inbound,
        FileChangeBatch {
            changes: vec![FileChange::delete("old/pipeline.yaml")],
            ..FileChangeBatch::default()
        },
    )
}

#[tokio::test]
async fn test_submit_queues_with_zero_retries() {
    let clock = ManualClock::new(5_000);
    let (store, service) = service(&clock);

    let parent = ChangeSetId::from("origin");
    let receipt = service
        .submit(submission("repo/main").with_parent(parent.clone()))
        .await
        .unwrap();
    assert_eq!(receipt.superseded, 0);

    let cs = store.get(&receipt.id).await.unwrap().unwrap();
    assert_eq!(cs.status, ChangeSetStatus::Queued);
    assert_eq!(cs.retry_count, 0);
    assert_eq!(cs.queued_on_ms, 5_000);
    assert_eq!(cs.last_updated_at_ms, 5_000);
    assert_eq!(cs.parent_id, Some(parent));
    assert_eq!(cs.direction, Direction::Inbound);
}

#[tokio::test]
async fn test_submit_rejects_blank_keys() {
    let clock = ManualClock::new(0);
    let (store, service) = service(&clock);

    let err = service.submit(submission("  ")).await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidSubmission(_)));
    let err = service
        .submit(ChangeSetSubmission::new("", "k", Direction::Outbound, FileChangeBatch::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidSubmission(_)));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_full_sync_supersedes_queued_on_same_key() {
    let clock = ManualClock::new(0);
    let (store, service) = service(&clock);
    let sink = InMemoryAuditSink::new(16);
    let audit = sink.reader();
    let service = service.with_audit(shared_sink(sink));

    let a = service.submit(submission("main")).await.unwrap().id;
    let b = service.submit(submission("main")).await.unwrap().id;
    let other = service.submit(submission("dev")).await.unwrap().id;
    // A running change set on the same key is not touched.
    store
        .claim_oldest(&GroupKey::new("acme", "main"), clock.now_ms())
        .await
        .unwrap();
    clock.advance(Duration::from_secs(1));

    let receipt = service.submit(submission("main").full_sync()).await.unwrap();
    assert_eq!(receipt.superseded, 1);

    assert_eq!(store.get(&a).await.unwrap().unwrap().status, ChangeSetStatus::Running);
    let superseded = store.get(&b).await.unwrap().unwrap();
    assert_eq!(superseded.status, ChangeSetStatus::Skipped);
    assert_eq!(superseded.message_code, Some(MessageCode::SupersededByFullSync));
    assert_eq!(store.get(&other).await.unwrap().unwrap().status, ChangeSetStatus::Queued);
    assert_eq!(
        store.get(&receipt.id).await.unwrap().unwrap().status,
        ChangeSetStatus::Queued
    );

    assert_eq!(audit.with_action(AuditAction::Submit).len(), 4);
    assert_eq!(audit.with_action(AuditAction::Supersede).len(), 1);
}

#[tokio::test]
async fn test_completion_callback_requires_running() {
    let clock = ManualClock::new(0);
    let (store, service) = service(&clock);
    let id = service.submit(submission("main")).await.unwrap().id;

    // Still queued: the callback is dropped.
    assert!(!service
        .complete(&id, ChangeSetStatus::Completed, None)
        .await
        .unwrap());

    store
        .claim_oldest(&GroupKey::new("acme", "main"), 1)
        .await
        .unwrap();
    assert!(service
        .complete(
            &id,
            ChangeSetStatus::Failed,
            Some(MessageCode::Delegate("MERGE_CONFLICT".into())),
        )
        .await
        .unwrap());

    let status = service.status(&id).await.unwrap();
    assert_eq!(status.status, ChangeSetStatus::Failed);
    assert_eq!(status.message_code, Some(MessageCode::Delegate("MERGE_CONFLICT".into())));

    // A second callback cannot overwrite the terminal state.
    assert!(!service
        .complete(&id, ChangeSetStatus::Completed, None)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_completion_callback_validates_target_status() {
    let clock = ManualClock::new(0);
    let (_store, service) = service(&clock);
    let id = service.submit(submission("main")).await.unwrap().id;

    let err = service
        .complete(&id, ChangeSetStatus::Queued, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidTransition { .. }));

    let err = service
        .complete(&ChangeSetId::from("nope"), ChangeSetStatus::Completed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NotFound(_)));
}

#[tokio::test]
async fn test_heartbeat_touches_running_only() {
    let clock = ManualClock::new(0);
    let (store, service) = service(&clock);
    let id = service.submit(submission("main")).await.unwrap().id;

    assert!(!service.heartbeat(&id).await.unwrap());

    store
        .claim_oldest(&GroupKey::new("acme", "main"), 0)
        .await
        .unwrap();
    clock.advance(Duration::from_secs(600));
    assert!(service.heartbeat(&id).await.unwrap());

    let status = service.status(&id).await.unwrap();
    assert_eq!(status.status, ChangeSetStatus::Running);
    assert_eq!(status.last_updated_at_ms, 600_000);
}

#[tokio::test]
async fn test_health_reports_totals() {
    let clock = ManualClock::new(0);
    let (store, service) = service(&clock);
    for key in ["a", "b", "c"] {
        service.submit(submission(key)).await.unwrap();
    }
    store
        .claim_oldest(&GroupKey::new("acme", "b"), 0)
        .await
        .unwrap();

    let health = service.health().await;
    assert!(health.ok);
    assert_eq!(health.queued, 2);
    assert_eq!(health.running, 1);
    assert_eq!(health.error, None);
}

#[tokio::test]
async fn test_status_response_serializes() {
    let clock = ManualClock::new(0);
    let (_store, service) = service(&clock);
    let id = service.submit(submission("main")).await.unwrap().id;

    let status = service.status(&id).await.unwrap();
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["status"], "QUEUED");
    assert_eq!(json["id"], id.as_str());
}
