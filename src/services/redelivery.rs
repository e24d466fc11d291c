use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::PushConfig;
use crate::metrics;
use crate::models::PendingNotification;
use crate::realtime::ConnectionRegistry;
use crate::services::PendingNotificationStore;

/// Reconciliation loop that drains the durable backlog into live connections.
///
/// Every interval it fetches a bounded batch of pending records, pushes the
/// ones whose user has reconnected, and deletes exactly what was delivered.
/// Expired records are purged on a much slower cadence inside the same loop.
pub struct RedeliveryScheduler {
    registry: ConnectionRegistry,
    store: Arc<PendingNotificationStore>,
    config: PushConfig,
    running: AtomicBool,
    last_sweep: Mutex<Option<Instant>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl RedeliveryScheduler {
    pub fn new(
        registry: ConnectionRegistry,
        store: Arc<PendingNotificationStore>,
        config: &PushConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        RedeliveryScheduler {
            registry,
            store,
            config: config.clone(),
            running: AtomicBool::new(false),
            last_sweep: Mutex::new(None),
            handle: Mutex::new(None),
            shutdown,
        }
    }

    /// Spawn the interval task. A second call while the task is alive warns
    /// and does nothing; after `stop` the scheduler can be started again.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            warn!("redelivery scheduler already started");
            return;
        }

        self.shutdown.send_replace(false);
        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let interval = self.config.redelivery_interval();

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                // the shutdown signal is only observed between passes, so a
                // pass in flight always runs to completion
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.run_reconciliation().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("redelivery scheduler stopped");
        }));

        info!(
            interval_secs = self.config.redelivery_interval_secs,
            fetch_limit = self.config.redelivery_fetch_limit,
            "redelivery scheduler started"
        );
    }

    /// Signal the interval task to exit and wait for it. In-flight work
    /// finishes before the task returns.
    pub async fn stop(&self) {
        let handle = {
            let mut guard = self.handle.lock().await;
            guard.take()
        };

        match handle {
            Some(handle) => {
                self.shutdown.send_replace(true);
                if let Err(err) = handle.await {
                    warn!(error = %err, "redelivery scheduler task ended abnormally");
                }
            }
            None => {
                debug!("redelivery scheduler stop requested while not running");
            }
        }
    }

    /// One reconciliation pass. Public so callers can drive redelivery
    /// outside the interval task.
    ///
    /// A pass that finds another pass still in flight is skipped outright,
    /// never queued behind it.
    pub async fn run_reconciliation(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("redelivery pass already in flight, skipping tick");
            metrics::record_skipped_tick();
            return;
        }

        self.redeliver_pending().await;
        self.sweep_if_due().await;

        self.running.store(false, Ordering::SeqCst);
    }

    async fn redeliver_pending(&self) {
        let pending = self
            .store
            .pending_across_users(self.config.redelivery_fetch_limit)
            .await;
        if pending.is_empty() {
            return;
        }

        // group by user, keeping oldest-first order within each group
        let mut by_user: HashMap<String, Vec<PendingNotification>> = HashMap::new();
        for record in pending {
            by_user
                .entry(record.user_id.clone())
                .or_default()
                .push(record);
        }

        let mut redelivered = 0u64;
        for (user_id, records) in by_user {
            if !self.registry.is_user_connected(&user_id).await {
                continue;
            }

            let mut delivered_ids = Vec::with_capacity(records.len());
            for record in &records {
                let envelope = record.to_envelope();
                let delivered = self.registry.send_to_user(&user_id, &envelope).await;
                if delivered > 0 {
                    delivered_ids.push(record.id);
                }
            }

            if !delivered_ids.is_empty() {
                let removed = self.store.delete_ids(&user_id, &delivered_ids).await;
                redelivered += delivered_ids.len() as u64;
                debug!(
                    user_id = %user_id,
                    delivered = delivered_ids.len(),
                    removed,
                    "redelivered pending notifications"
                );
            }
        }

        if redelivered > 0 {
            info!(
                count = redelivered,
                "redelivered pending notifications to reconnected users"
            );
            metrics::record_backlog_redelivered(redelivered);
        }
    }

    async fn sweep_if_due(&self) {
        let mut last_sweep = self.last_sweep.lock().await;
        let due = match *last_sweep {
            Some(at) => at.elapsed() >= self.config.expiry_sweep_interval(),
            None => true,
        };
        if !due {
            return;
        }
        *last_sweep = Some(Instant::now());
        drop(last_sweep);

        self.store.cleanup_expired().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModelKind, Role};
    use crate::realtime::{Connection, Envelope, SseReceiver, SseSink};
    use crate::storage::{InMemoryNotificationStorage, NotificationStorage};
    use chrono::Utc;
    use serde_json::json;

    fn harness() -> (
        Arc<RedeliveryScheduler>,
        ConnectionRegistry,
        Arc<PendingNotificationStore>,
        Arc<InMemoryNotificationStorage>,
    ) {
        let storage = Arc::new(InMemoryNotificationStorage::new());
        let config = PushConfig::default();
        let store = Arc::new(PendingNotificationStore::new(storage.clone(), &config));
        let registry = ConnectionRegistry::new();
        let scheduler = Arc::new(RedeliveryScheduler::new(
            registry.clone(),
            store.clone(),
            &config,
        ));
        (scheduler, registry, store, storage)
    }

    fn connection_with_sink(device_id: &str) -> (Connection, SseReceiver) {
        let (sink, rx) = SseSink::channel();
        let connection = Connection::new(device_id, Role::Resident, None, Arc::new(sink));
        (connection, rx)
    }

    fn recv_text(rx: &mut SseReceiver) -> String {
        let payload = rx.try_recv().expect("expected a frame").expect("stream ended");
        String::from_utf8(payload.to_vec()).expect("frame is utf-8")
    }

    #[tokio::test]
    async fn test_delivers_backlog_to_reconnected_user_and_deletes_it() {
        let (scheduler, registry, store, storage) = harness();
        let envelope = Envelope::notification(ModelKind::Notice, json!({"notice_id": 42}));
        store.save("u1", ModelKind::Notice, &envelope).await;

        let (connection, mut rx) = connection_with_sink("device-a");
        registry.add_client("u1", connection).await;

        scheduler.run_reconciliation().await;

        let frame = recv_text(&mut rx);
        assert!(frame.starts_with("event: notification\n"));
        assert!(frame.contains("\"missed\":true"));
        assert!(frame.contains(&envelope.id.to_string()));
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_offline_users_keep_their_backlog() {
        let (scheduler, _registry, store, storage) = harness();
        let envelope = Envelope::notification(ModelKind::Poll, json!({"poll_id": 3}));
        store.save("u2", ModelKind::Poll, &envelope).await;

        scheduler.run_reconciliation().await;

        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_push_keeps_the_record_for_the_next_pass() {
        let (scheduler, registry, store, storage) = harness();
        let envelope = Envelope::alarm(ModelKind::Complaint, json!({"unit": "1203"}));
        store.save("u1", ModelKind::Complaint, &envelope).await;

        let (connection, rx) = connection_with_sink("device-a");
        registry.add_client("u1", connection).await;
        drop(rx);

        scheduler.run_reconciliation().await;

        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_overlapping_pass_is_skipped_not_queued() {
        let (scheduler, registry, store, storage) = harness();
        let envelope = Envelope::notification(ModelKind::Notice, json!({"n": 1}));
        store.save("u1", ModelKind::Notice, &envelope).await;

        let (connection, mut rx) = connection_with_sink("device-a");
        registry.add_client("u1", connection).await;

        scheduler.running.store(true, Ordering::SeqCst);
        scheduler.run_reconciliation().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(storage.len().await, 1);

        scheduler.running.store(false, Ordering::SeqCst);
        scheduler.run_reconciliation().await;

        assert!(rx.try_recv().is_ok());
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_pass_sweeps_expired_records() {
        let (scheduler, _registry, _store, storage) = harness();
        let envelope = Envelope::notification(ModelKind::Notice, json!({"old": true}));
        let mut record =
            PendingNotification::from_envelope("u1", ModelKind::Notice, &envelope, 7);
        record.created_at = Utc::now() - chrono::Duration::days(10);
        record.expires_at = Utc::now() - chrono::Duration::days(3);
        storage.insert_batch(&[record]).await.unwrap();

        scheduler.run_reconciliation().await;

        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_expired_records_are_not_redelivered() {
        let (scheduler, registry, _store, storage) = harness();
        let envelope = Envelope::notification(ModelKind::Notice, json!({"old": true}));
        let mut record =
            PendingNotification::from_envelope("u1", ModelKind::Notice, &envelope, 7);
        record.created_at = Utc::now() - chrono::Duration::days(10);
        record.expires_at = Utc::now() - chrono::Duration::days(3);
        storage.insert_batch(&[record]).await.unwrap();

        let (connection, mut rx) = connection_with_sink("device-a");
        registry.add_client("u1", connection).await;

        scheduler.run_reconciliation().await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_allows_restart() {
        let (scheduler, _registry, _store, _storage) = harness();

        scheduler.start().await;
        scheduler.start().await;
        assert!(scheduler.handle.lock().await.is_some());

        scheduler.stop().await;
        assert!(scheduler.handle.lock().await.is_none());

        scheduler.start().await;
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_start_is_a_noop() {
        let (scheduler, _registry, _store, _storage) = harness();
        scheduler.stop().await;
    }
}
