use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{ModelKind, PendingNotification};

use super::{NotificationStorage, StorageError, StorageResult};

/// In-memory storage twin used by the hermetic test suite.
///
/// Failure injection mirrors the two interesting production failure shapes:
/// everything failing, or only the bulk write path failing so the per-record
/// fallback gets exercised.
#[derive(Default)]
pub struct InMemoryNotificationStorage {
    records: RwLock<Vec<PendingNotification>>,
    fail_all: AtomicBool,
    fail_batch_inserts: AtomicBool,
}

impl InMemoryNotificationStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_batch_inserts(&self, fail: bool) {
        self.fail_batch_inserts.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationStorage for InMemoryNotificationStorage {
    async fn insert_batch(&self, records: &[PendingNotification]) -> StorageResult<u64> {
        self.check_available()?;
        if self.fail_batch_inserts.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected batch failure".into()));
        }

        let mut guard = self.records.write().await;
        let mut inserted = 0;
        for record in records {
            let exists = guard
                .iter()
                .any(|r| r.id == record.id && r.user_id == record.user_id);
            if !exists {
                guard.push(record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_one(&self, record: &PendingNotification) -> StorageResult<()> {
        self.check_available()?;

        let mut guard = self.records.write().await;
        let exists = guard
            .iter()
            .any(|r| r.id == record.id && r.user_id == record.user_id);
        if exists {
            return Err(StorageError::Duplicate);
        }
        guard.push(record.clone());
        Ok(())
    }

    async fn find_for_user(
        &self,
        user_id: &str,
        model: Option<ModelKind>,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<PendingNotification>> {
        self.check_available()?;

        let guard = self.records.read().await;
        let mut matches: Vec<PendingNotification> = guard
            .iter()
            .filter(|r| r.user_id == user_id)
            .filter(|r| model.map(|m| r.model == m).unwrap_or(true))
            .filter(|r| !r.is_expired(now))
            .cloned()
            .collect();
        matches.sort_by_key(|r| r.created_at);
        Ok(matches)
    }

    async fn find_all_pending(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<PendingNotification>> {
        self.check_available()?;

        let guard = self.records.read().await;
        let mut matches: Vec<PendingNotification> = guard
            .iter()
            .filter(|r| !r.is_expired(now))
            .cloned()
            .collect();
        matches.sort_by_key(|r| r.created_at);
        matches.truncate(limit.max(0) as usize);
        Ok(matches)
    }

    async fn delete_ids(&self, user_id: &str, ids: &[Uuid]) -> StorageResult<u64> {
        self.check_available()?;

        let mut guard = self.records.write().await;
        let before = guard.len();
        guard.retain(|r| !(r.user_id == user_id && ids.contains(&r.id)));
        Ok((before - guard.len()) as u64)
    }

    async fn delete_for_user(
        &self,
        user_id: &str,
        model: Option<ModelKind>,
    ) -> StorageResult<u64> {
        self.check_available()?;

        let mut guard = self.records.write().await;
        let before = guard.len();
        guard.retain(|r| {
            !(r.user_id == user_id && model.map(|m| r.model == m).unwrap_or(true))
        });
        Ok((before - guard.len()) as u64)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        self.check_available()?;

        let mut guard = self.records.write().await;
        let before = guard.len();
        guard.retain(|r| !r.is_expired(now));
        Ok((before - guard.len()) as u64)
    }
}
