use std::sync::Arc;

/// Backlog flows exercised end to end over the in-memory storage twin:
/// offline queueing, reconnect redelivery, expiry cleanup and apartment
/// dispatch, all without a database or a network listener.
use chrono::Utc;
use serde_json::json;
use terrace_push::config::PushConfig;
use terrace_push::models::{ModelKind, PendingNotification, Role};
use terrace_push::realtime::{Connection, ConnectionRegistry, Envelope, SseReceiver, SseSink};
use terrace_push::services::{
    DispatchOutcome, InMemoryEventManager, NotificationDispatcher, PendingNotificationStore,
    RedeliveryScheduler,
};
use terrace_push::storage::{InMemoryNotificationStorage, NotificationStorage};

struct Harness {
    registry: ConnectionRegistry,
    store: Arc<PendingNotificationStore>,
    storage: Arc<InMemoryNotificationStorage>,
    scheduler: Arc<RedeliveryScheduler>,
}

fn harness() -> Harness {
    let config = PushConfig::default();
    let storage = Arc::new(InMemoryNotificationStorage::new());
    let store = Arc::new(PendingNotificationStore::new(storage.clone(), &config));
    let registry = ConnectionRegistry::new();
    let scheduler = Arc::new(RedeliveryScheduler::new(
        registry.clone(),
        store.clone(),
        &config,
    ));
    Harness {
        registry,
        store,
        storage,
        scheduler,
    }
}

async fn attach(registry: &ConnectionRegistry, user_id: &str, device_id: &str) -> SseReceiver {
    let (sink, rx) = SseSink::channel();
    let connection = Connection::new(device_id, Role::Resident, None, Arc::new(sink));
    registry.add_client(user_id, connection).await;
    rx
}

fn recv_text(rx: &mut SseReceiver) -> String {
    let payload = rx.try_recv().expect("expected a frame").expect("stream ended");
    String::from_utf8(payload.to_vec()).expect("frame is utf-8")
}

#[tokio::test]
async fn test_offline_save_reconnect_redeliver_exactly_once() {
    let h = harness();
    let envelope = Envelope::notification(ModelKind::Notice, json!({"title": "gate code change"}));

    // u1 is offline: the notification lands in the backlog
    h.store.save("u1", ModelKind::Notice, &envelope).await;
    assert_eq!(h.store.pending_for("u1", None).await.len(), 1);

    // u1 attaches a live sink, then the next reconciliation pass runs
    let mut rx = attach(&h.registry, "u1", "device-a").await;
    h.scheduler.run_reconciliation().await;

    // exactly one envelope arrives, flagged missed, carrying the original id
    let frame = recv_text(&mut rx);
    assert!(frame.starts_with("event: notification\n"));
    assert!(frame.contains("\"missed\":true"));
    assert!(frame.contains(&envelope.id.to_string()));
    assert!(rx.try_recv().is_err());

    // and the backlog is empty, so a second pass delivers nothing
    assert!(h.store.pending_for("u1", None).await.is_empty());
    h.scheduler.run_reconciliation().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_backlog_survives_passes_until_the_user_returns() {
    let h = harness();
    let envelope = Envelope::alarm(ModelKind::Complaint, json!({"unit": "703"}));
    h.store.save("u1", ModelKind::Complaint, &envelope).await;

    h.scheduler.run_reconciliation().await;
    h.scheduler.run_reconciliation().await;
    assert_eq!(h.storage.len().await, 1);

    let mut rx = attach(&h.registry, "u1", "device-a").await;
    h.scheduler.run_reconciliation().await;

    assert!(rx.try_recv().is_ok());
    assert!(h.storage.is_empty().await);
}

#[tokio::test]
async fn test_saved_record_visible_before_expiry_and_purged_after() {
    let h = harness();
    let fresh = Envelope::notification(ModelKind::Notice, json!({"n": 1}));
    h.store
        .save_with_ttl("u1", ModelKind::Notice, &fresh, 1)
        .await;
    assert_eq!(h.store.pending_for("u1", None).await.len(), 1);

    // a record already past its expiry is invisible to reads
    let stale = Envelope::notification(ModelKind::Notice, json!({"n": 2}));
    let mut expired = PendingNotification::from_envelope("u1", ModelKind::Notice, &stale, 7);
    expired.created_at = Utc::now() - chrono::Duration::days(9);
    expired.expires_at = Utc::now() - chrono::Duration::days(2);
    h.storage.insert_batch(&[expired]).await.unwrap();
    assert_eq!(h.store.pending_for("u1", None).await.len(), 1);

    // cleanup reports the purge once, then finds nothing left
    assert_eq!(h.store.cleanup_expired().await, 1);
    assert_eq!(h.store.cleanup_expired().await, 0);
    assert_eq!(h.storage.len().await, 1);
}

#[tokio::test]
async fn test_multi_device_user_receives_on_every_sink() {
    let h = harness();
    let envelope = Envelope::notification(ModelKind::Poll, json!({"poll_id": 12}));
    h.store.save("u1", ModelKind::Poll, &envelope).await;

    let mut rx_phone = attach(&h.registry, "u1", "phone").await;
    let mut rx_web = attach(&h.registry, "u1", "web").await;
    h.scheduler.run_reconciliation().await;

    assert!(rx_phone.try_recv().is_ok());
    assert!(rx_web.try_recv().is_ok());
    assert!(h.storage.is_empty().await);
}

#[tokio::test]
async fn test_apartment_dispatch_splits_live_and_backlog() {
    let h = harness();
    let events = Arc::new(InMemoryEventManager::new());
    events.set_recipients("apt-100", &["u1", "u2"]).await;
    let dispatcher = NotificationDispatcher::new(
        h.registry.clone(),
        h.store.clone(),
        events.clone(),
    );

    let mut rx_live = attach(&h.registry, "u1", "device-a").await;
    let envelope = Envelope::notification(ModelKind::Notice, json!({"title": "water cut"}));
    let outcome = dispatcher
        .dispatch_to_apartment("apt-100", ModelKind::Notice, &envelope)
        .await
        .unwrap();

    assert_eq!(outcome, DispatchOutcome { delivered: 1, queued: 1 });
    assert!(rx_live.try_recv().is_ok());
    assert_eq!(h.store.pending_for("u2", None).await.len(), 1);

    // u2 comes online later and the scheduler catches them up
    let mut rx_late = attach(&h.registry, "u2", "device-b").await;
    h.scheduler.run_reconciliation().await;

    let frame = recv_text(&mut rx_late);
    assert!(frame.contains(&envelope.id.to_string()));
    assert!(frame.contains("\"missed\":true"));
    assert!(h.storage.is_empty().await);
}

#[tokio::test]
async fn test_deleting_one_users_copy_keeps_the_other_recipients() {
    let h = harness();
    let envelope = Envelope::notification(ModelKind::Notice, json!({"shared": true}));
    let recipients = vec!["u1".to_string(), "u2".to_string()];
    h.store
        .save_many(&recipients, ModelKind::Notice, &envelope)
        .await;

    let removed = h.store.delete_ids("u1", &[envelope.id]).await;

    assert_eq!(removed, 1);
    assert!(h.store.pending_for("u1", None).await.is_empty());
    assert_eq!(h.store.pending_for("u2", None).await.len(), 1);
}
