//! Tests for error types

use changeset_scheduler::core::{ChangeSetId, ChangeSetStatus, SchedulerError};

#[test]
fn test_invalid_transition_error() {
    let err = SchedulerError::InvalidTransition {
        id: ChangeSetId::from("cs-1"),
        from: ChangeSetStatus::Completed,
        to: ChangeSetStatus::Queued,
    };
    assert_eq!(
        format!("{err}"),
        "invalid transition for change set cs-1: COMPLETED -> QUEUED"
    );
}

#[test]
fn test_not_found_error() {
    let err = SchedulerError::NotFound(ChangeSetId::from("missing"));
    assert_eq!(format!("{err}"), "change set not found: missing");
}

#[test]
fn test_store_errors() {
    let permanent = SchedulerError::Store("disk full".to_string());
    let transient = SchedulerError::Transient("connection reset".to_string());
    assert_eq!(format!("{permanent}"), "store error: disk full");
    assert_eq!(format!("{transient}"), "transient store error: connection reset");
    assert!(!permanent.is_transient());
    assert!(transient.is_transient());
}

#[test]
fn test_invalid_submission_error() {
    let err = SchedulerError::InvalidSubmission("queue_key is empty".to_string());
    assert_eq!(format!("{err}"), "invalid submission: queue_key is empty");
}

#[test]
fn test_serde_errors_convert() {
    let parse = serde_json::from_str::<ChangeSetStatus>("\"PAUSED\"").unwrap_err();
    let err = SchedulerError::from(parse);
    assert!(matches!(err, SchedulerError::Serialization(_)));
    assert!(!err.is_transient());
}
