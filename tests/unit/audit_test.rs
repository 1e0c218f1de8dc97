//! Tests for audit sink

use changeset_scheduler::core::{
    build_audit_event, AuditAction, AuditSink, ChangeSetId, InMemoryAuditSink, MessageCode,
};

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);

    let event = build_audit_event(
        Some(ChangeSetId::from("cs-1")),
        "tenant1",
        AuditAction::Claim,
        1,
        None,
        42,
    );

    sink.record(event);
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].change_set_id, Some(ChangeSetId::from("cs-1")));
    assert_eq!(events[0].tenant_id, "tenant1");
    assert_eq!(events[0].action, AuditAction::Claim);
    assert_eq!(events[0].created_at_ms, 42);
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);

    for (i, action) in [AuditAction::Submit, AuditAction::Claim, AuditAction::Complete]
        .into_iter()
        .enumerate()
    {
        sink.record(build_audit_event(None, "tenant1", action, 1, None, i as u128));
    }

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].action, AuditAction::Claim); // First one popped
    assert_eq!(events[1].action, AuditAction::Complete);
}

#[test]
fn test_reader_sees_events_after_boxing() {
    let sink = InMemoryAuditSink::new(8);
    let reader = sink.reader();
    let mut boxed: Box<dyn AuditSink> = Box::new(sink);

    boxed.record(build_audit_event(
        None,
        "*",
        AuditAction::Expire,
        4,
        Some(MessageCode::MaxQueueDurationExceeded),
        7,
    ));
    boxed.record(build_audit_event(None, "acme", AuditAction::Requeue, 2, None, 8));

    assert_eq!(reader.events().len(), 2);
    let expired = reader.with_action(AuditAction::Expire);
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].affected, 4);
    assert_eq!(
        expired[0].message_code,
        Some(MessageCode::MaxQueueDurationExceeded)
    );
}

#[test]
fn test_action_names() {
    assert_eq!(AuditAction::Exhaust.to_string(), "exhaust");
    assert_eq!(AuditAction::Supersede.as_str(), "supersede");
}
