use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PushConfig;
use crate::metrics;
use crate::models::{ModelKind, PendingNotification};
use crate::realtime::Envelope;
use crate::storage::{NotificationStorage, StorageError};

/// Durable backlog of notifications that found no live recipient.
///
/// Records pass through an in-process queue that is flushed as part of every
/// save, so under normal operation the queue is empty the moment a save
/// returns. The queue exists to absorb records that arrive while a flush is
/// already writing: they are swapped out by the next flush instead of being
/// interleaved into the running one.
pub struct PendingNotificationStore {
    storage: Arc<dyn NotificationStorage>,
    queue: Mutex<Vec<PendingNotification>>,
    flush_lock: Mutex<()>,
    batch_size: usize,
    ttl_days: i64,
}

impl PendingNotificationStore {
    pub fn new(storage: Arc<dyn NotificationStorage>, config: &PushConfig) -> Self {
        PendingNotificationStore {
            storage,
            queue: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            batch_size: config.write_batch_size.max(1),
            ttl_days: config.backlog_ttl_days,
        }
    }

    /// Queue an envelope for one offline recipient and flush immediately.
    pub async fn save(&self, user_id: &str, model: ModelKind, envelope: &Envelope) {
        self.save_with_ttl(user_id, model, envelope, self.ttl_days)
            .await;
    }

    /// Same as `save` with an explicit retention period. Non-positive day
    /// counts fall back to the configured default.
    pub async fn save_with_ttl(
        &self,
        user_id: &str,
        model: ModelKind,
        envelope: &Envelope,
        ttl_days: i64,
    ) {
        let ttl_days = if ttl_days > 0 { ttl_days } else { self.ttl_days };
        let record = PendingNotification::from_envelope(user_id, model, envelope, ttl_days);
        self.enqueue(vec![record]).await;
        self.flush().await;
    }

    /// Mirror one envelope to many offline recipients in a single flush.
    pub async fn save_many(&self, user_ids: &[String], model: ModelKind, envelope: &Envelope) {
        if user_ids.is_empty() {
            return;
        }
        let records = user_ids
            .iter()
            .map(|user_id| {
                PendingNotification::from_envelope(user_id, model, envelope, self.ttl_days)
            })
            .collect();
        self.enqueue(records).await;
        self.flush().await;
    }

    async fn enqueue(&self, records: Vec<PendingNotification>) {
        let mut queue = self.queue.lock().await;
        queue.extend(records);
    }

    /// Drain the queue and persist it, in `batch_size` chunks.
    ///
    /// The flush lock serializes writers; the queue swap happens in one
    /// motion under its own lock, so records enqueued mid-write land in the
    /// next flush rather than this one. Returns the count persisted.
    pub async fn flush(&self) -> usize {
        let _writer = self.flush_lock.lock().await;

        let drained: Vec<PendingNotification> = {
            let mut queue = self.queue.lock().await;
            std::mem::take(&mut *queue)
        };
        if drained.is_empty() {
            return 0;
        }

        let mut persisted = 0usize;
        for chunk in drained.chunks(self.batch_size) {
            match self.storage.insert_batch(chunk).await {
                Ok(written) => persisted += written as usize,
                Err(err) => {
                    warn!(
                        error = %err,
                        records = chunk.len(),
                        "bulk write of pending notifications failed, retrying records individually"
                    );
                    persisted += self.write_individually(chunk).await;
                }
            }
        }

        if persisted > 0 {
            metrics::record_backlog_saved(persisted as u64);
        }
        debug!(persisted, "flushed pending notification queue");
        persisted
    }

    /// Per-record fallback so one bad record cannot sink a whole chunk.
    async fn write_individually(&self, records: &[PendingNotification]) -> usize {
        let mut persisted = 0usize;
        for record in records {
            match self.storage.insert_one(record).await {
                Ok(()) => persisted += 1,
                Err(StorageError::Duplicate) => {
                    debug!(
                        user_id = %record.user_id,
                        notification_id = %record.id,
                        "pending notification already persisted, skipping"
                    );
                }
                Err(err) => {
                    error!(
                        error = %err,
                        user_id = %record.user_id,
                        notification_id = %record.id,
                        "failed to persist pending notification, record dropped"
                    );
                }
            }
        }
        persisted
    }

    /// Non-expired backlog for one user, oldest first. Empty on storage
    /// failure.
    pub async fn pending_for(
        &self,
        user_id: &str,
        model: Option<ModelKind>,
    ) -> Vec<PendingNotification> {
        match self.storage.find_for_user(user_id, model, Utc::now()).await {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    error = %err,
                    user_id = %user_id,
                    "failed to read pending notifications"
                );
                Vec::new()
            }
        }
    }

    /// Up to `limit` non-expired records across all users, oldest first.
    pub async fn pending_across_users(&self, limit: i64) -> Vec<PendingNotification> {
        match self.storage.find_all_pending(limit, Utc::now()).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "failed to read pending notification backlog");
                Vec::new()
            }
        }
    }

    /// Drop one user's backlog for a single model. Returns the count removed.
    pub async fn delete(&self, user_id: &str, model: ModelKind) -> u64 {
        match self.storage.delete_for_user(user_id, Some(model)).await {
            Ok(removed) => removed,
            Err(err) => {
                error!(
                    error = %err,
                    user_id = %user_id,
                    model = %model.as_str(),
                    "failed to delete pending notifications"
                );
                0
            }
        }
    }

    /// Drop one user's entire backlog. Returns the count removed.
    pub async fn clear(&self, user_id: &str) -> u64 {
        match self.storage.delete_for_user(user_id, None).await {
            Ok(removed) => removed,
            Err(err) => {
                error!(
                    error = %err,
                    user_id = %user_id,
                    "failed to clear pending notifications"
                );
                0
            }
        }
    }

    /// Remove exactly the given record ids from one user's backlog.
    pub async fn delete_ids(&self, user_id: &str, ids: &[Uuid]) -> u64 {
        if ids.is_empty() {
            return 0;
        }
        match self.storage.delete_ids(user_id, ids).await {
            Ok(removed) => removed,
            Err(err) => {
                error!(
                    error = %err,
                    user_id = %user_id,
                    ids = ids.len(),
                    "failed to delete delivered pending notifications"
                );
                0
            }
        }
    }

    /// Purge every expired record. Returns the count removed, 0 on failure.
    pub async fn cleanup_expired(&self) -> u64 {
        match self.storage.delete_expired(Utc::now()).await {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "purged expired pending notifications");
                    metrics::record_backlog_purged(removed);
                }
                removed
            }
            Err(err) => {
                error!(error = %err, "failed to purge expired pending notifications");
                0
            }
        }
    }

    /// Final flush on service shutdown.
    pub async fn shutdown(&self) {
        let persisted = self.flush().await;
        info!(persisted, "pending notification store flushed for shutdown");
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }
}
