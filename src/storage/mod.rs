//! Durable storage for the pending-notification backlog.
//!
//! The trait abstracts the database so the store and scheduler can be tested
//! against an in-memory implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ModelKind, PendingNotification};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryNotificationStorage;
pub use postgres::PgNotificationStorage;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// A record with the same (user_id, id) already exists
    #[error("duplicate record")]
    Duplicate,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Persistence collaborator for pending notifications.
///
/// `now` is always passed in by the caller so expiry semantics stay testable
/// without waiting out a TTL.
#[async_trait]
pub trait NotificationStorage: Send + Sync {
    /// Bulk-insert records, silently skipping ones that already exist.
    /// Returns the number actually inserted.
    async fn insert_batch(&self, records: &[PendingNotification]) -> StorageResult<u64>;

    /// Insert a single record; a pre-existing (user_id, id) pair is reported
    /// as `StorageError::Duplicate`.
    async fn insert_one(&self, record: &PendingNotification) -> StorageResult<()>;

    /// Non-expired records for one user, oldest first, optionally narrowed to
    /// one model.
    async fn find_for_user(
        &self,
        user_id: &str,
        model: Option<ModelKind>,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<PendingNotification>>;

    /// Up to `limit` non-expired records across all users, oldest first.
    async fn find_all_pending(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<PendingNotification>>;

    /// Delete the given record ids for one user. Returns the number removed.
    async fn delete_ids(&self, user_id: &str, ids: &[Uuid]) -> StorageResult<u64>;

    /// Delete a user's records, optionally narrowed to one model. Returns the
    /// number removed.
    async fn delete_for_user(&self, user_id: &str, model: Option<ModelKind>) -> StorageResult<u64>;

    /// Delete every record whose TTL has lapsed. Returns the number removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> StorageResult<u64>;
}
