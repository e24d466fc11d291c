use chrono::{Duration, Utc};
/// Unit tests for terrace-push core types
///
/// This test module covers:
/// - Envelope wire shape and SSE framing
/// - Enum parsing helpers
/// - Pending-record construction, redelivery marking and expiry
use serde_json::json;
use terrace_push::models::*;
use terrace_push::realtime::{Envelope, SSE_HEARTBEAT_FRAME};

#[test]
fn test_event_kind_serialization() {
    let kinds = vec![EventKind::Alarm, EventKind::Notification, EventKind::Event];

    for kind in kinds {
        let json = serde_json::to_string(&kind).unwrap();
        let deserialized: EventKind = serde_json::from_str(&json).unwrap();
        assert_eq!(kind, deserialized);
    }
}

#[test]
fn test_model_kind_serialization() {
    let models = vec![
        ModelKind::Notice,
        ModelKind::Poll,
        ModelKind::Complaint,
        ModelKind::Comment,
        ModelKind::Request,
    ];

    for model in models {
        let json = serde_json::to_string(&model).unwrap();
        let deserialized: ModelKind = serde_json::from_str(&json).unwrap();
        assert_eq!(model, deserialized);
    }
}

#[test]
fn test_event_kind_as_str_and_parse() {
    assert_eq!(EventKind::Alarm.as_str(), "alarm");
    assert_eq!(EventKind::Notification.as_str(), "notification");
    assert_eq!(EventKind::Event.as_str(), "event");

    assert_eq!(EventKind::parse("alarm"), Some(EventKind::Alarm));
    assert_eq!(EventKind::parse("nope"), None);
}

#[test]
fn test_model_kind_as_str_and_parse() {
    assert_eq!(ModelKind::Notice.as_str(), "notice");
    assert_eq!(ModelKind::Poll.as_str(), "poll");
    assert_eq!(ModelKind::Complaint.as_str(), "complaint");
    assert_eq!(ModelKind::Comment.as_str(), "comment");
    assert_eq!(ModelKind::Request.as_str(), "request");

    assert_eq!(ModelKind::parse("poll"), Some(ModelKind::Poll));
    assert_eq!(ModelKind::parse("Notice"), None);
}

#[test]
fn test_role_as_str_and_parse() {
    assert_eq!(Role::Resident.as_str(), "resident");
    assert_eq!(Role::Manager.as_str(), "manager");
    assert_eq!(Role::Admin.as_str(), "admin");

    assert_eq!(Role::parse("manager"), Some(Role::Manager));
    assert_eq!(Role::parse("superuser"), None);
}

#[test]
fn test_notification_envelope_wire_shape() {
    let envelope = Envelope::notification(ModelKind::Notice, json!({"title": "lobby painting"}));
    let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

    assert_eq!(value["type"], "notification");
    assert_eq!(value["model"], "notice");
    assert_eq!(value["data"]["title"], "lobby painting");
    assert!(value.get("missed").is_none());
    assert!(value.get("id").is_some());
    assert!(value.get("timestamp").is_some());
}

#[test]
fn test_event_envelope_omits_model() {
    let envelope = Envelope::event(json!({"k": "v"}));
    let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

    assert_eq!(value["type"], "event");
    assert!(value.get("model").is_none());
}

#[test]
fn test_envelope_round_trip() {
    let envelope = Envelope::alarm(ModelKind::Complaint, json!({"unit": "1802"})).with_missed();
    let parsed = Envelope::from_json(&envelope.to_json().unwrap()).unwrap();

    assert_eq!(parsed.id, envelope.id);
    assert_eq!(parsed.kind, envelope.kind);
    assert_eq!(parsed.model, envelope.model);
    assert_eq!(parsed.data, envelope.data);
    assert_eq!(parsed.missed, Some(true));
}

#[test]
fn test_sse_frame_layout() {
    let envelope = Envelope::alarm(ModelKind::Complaint, json!({"unit": "904"}));
    let frame = envelope.sse_frame().unwrap();

    assert!(frame.starts_with("event: alarm\n"));
    assert!(frame.contains("\ndata: {"));
    assert!(frame.ends_with("\n\n"));
}

#[test]
fn test_heartbeat_frame_is_an_sse_comment() {
    assert_eq!(SSE_HEARTBEAT_FRAME, ": ping\n\n");
    assert!(SSE_HEARTBEAT_FRAME.starts_with(':'));
}

#[test]
fn test_pending_record_mirrors_the_envelope() {
    let envelope = Envelope::notification(ModelKind::Poll, json!({"poll_id": 5}));
    let record = PendingNotification::from_envelope("u1", ModelKind::Poll, &envelope, 3);

    assert_eq!(record.id, envelope.id);
    assert_eq!(record.user_id, "u1");
    assert_eq!(record.kind, EventKind::Notification);
    assert_eq!(record.payload, json!({"poll_id": 5}));
    assert_eq!(record.expires_at - record.created_at, Duration::days(3));
}

#[test]
fn test_pending_record_defaults_non_positive_ttl() {
    let envelope = Envelope::notification(ModelKind::Notice, json!({}));

    for ttl in [0, -1] {
        let record = PendingNotification::from_envelope("u1", ModelKind::Notice, &envelope, ttl);
        assert_eq!(record.expires_at - record.created_at, Duration::days(7));
        assert!(record.expires_at > record.created_at);
    }
}

#[test]
fn test_pending_record_expiry_boundary() {
    let envelope = Envelope::notification(ModelKind::Notice, json!({}));
    let record = PendingNotification::from_envelope("u1", ModelKind::Notice, &envelope, 1);

    assert!(!record.is_expired(record.created_at));
    assert!(!record.is_expired(record.expires_at - Duration::seconds(1)));
    assert!(record.is_expired(record.expires_at));
    assert!(record.is_expired(record.expires_at + Duration::seconds(1)));
}

#[test]
fn test_redelivered_envelope_is_marked_missed() {
    let original = Envelope::notification(ModelKind::Comment, json!({"text": "welcome"}));
    let record = PendingNotification::from_envelope("u1", ModelKind::Comment, &original, 7);
    let redelivered = record.to_envelope();

    assert_eq!(redelivered.id, original.id);
    assert_eq!(redelivered.kind, original.kind);
    assert_eq!(redelivered.model, Some(ModelKind::Comment));
    assert_eq!(redelivered.missed, Some(true));
    assert_eq!(redelivered.timestamp, record.created_at);
}

#[test]
fn test_missed_batch_wraps_items_in_an_array() {
    let items = vec![json!({"n": 1}), json!({"n": 2})];
    let batch = Envelope::missed_batch(items);
    let value: serde_json::Value = serde_json::from_str(&batch.to_json().unwrap()).unwrap();

    assert_eq!(value["missed"], true);
    assert!(value["data"].is_array());
    assert_eq!(value["data"].as_array().unwrap().len(), 2);
}

#[test]
fn test_connection_info_omits_missing_apartment() {
    let info = ConnectionInfo {
        user_id: "u1".to_string(),
        device_id: "device-a".to_string(),
        role: Role::Admin,
        apartment_id: None,
        connected_at: Utc::now(),
    };

    let value = serde_json::to_value(&info).unwrap();
    assert!(value.get("apartment_id").is_none());
    assert_eq!(value["role"], "admin");
}
