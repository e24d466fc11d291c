use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{EventKind, ModelKind, PendingNotification};

use super::{NotificationStorage, StorageError, StorageResult};

/// PostgreSQL-backed storage for the pending-notification backlog.
pub struct PgNotificationStorage {
    pool: PgPool,
}

impl PgNotificationStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn try_record(row: &PgRow) -> Result<Option<PendingNotification>, sqlx::Error> {
        let model_raw: String = row.try_get("model")?;
        let kind_raw: String = row.try_get("event_type")?;

        let model = match ModelKind::parse(&model_raw) {
            Some(model) => model,
            None => {
                warn!(model = %model_raw, "skipping pending row with unknown model");
                return Ok(None);
            }
        };
        let kind = match EventKind::parse(&kind_raw) {
            Some(kind) => kind,
            None => {
                warn!(event_type = %kind_raw, "skipping pending row with unknown event type");
                return Ok(None);
            }
        };

        Ok(Some(PendingNotification {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            model,
            kind,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        }))
    }

    fn collect_records(rows: Vec<PgRow>) -> Result<Vec<PendingNotification>, sqlx::Error> {
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(record) = Self::try_record(&row)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

#[async_trait]
impl NotificationStorage for PgNotificationStorage {
    async fn insert_batch(&self, records: &[PendingNotification]) -> StorageResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut ids: Vec<Uuid> = Vec::with_capacity(records.len());
        let mut user_ids: Vec<String> = Vec::with_capacity(records.len());
        let mut models: Vec<String> = Vec::with_capacity(records.len());
        let mut kinds: Vec<String> = Vec::with_capacity(records.len());
        let mut payloads: Vec<Value> = Vec::with_capacity(records.len());
        let mut created: Vec<DateTime<Utc>> = Vec::with_capacity(records.len());
        let mut expires: Vec<DateTime<Utc>> = Vec::with_capacity(records.len());
        for record in records {
            ids.push(record.id);
            user_ids.push(record.user_id.clone());
            models.push(record.model.as_str().to_string());
            kinds.push(record.kind.as_str().to_string());
            payloads.push(record.payload.clone());
            created.push(record.created_at);
            expires.push(record.expires_at);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO pending_notifications (
                id, user_id, model, event_type, payload, created_at, expires_at
            )
            SELECT * FROM unnest(
                $1::uuid[], $2::text[], $3::text[], $4::text[],
                $5::jsonb[], $6::timestamptz[], $7::timestamptz[]
            )
            ON CONFLICT (user_id, id) DO NOTHING
            "#,
        )
        .bind(&ids)
        .bind(&user_ids)
        .bind(&models)
        .bind(&kinds)
        .bind(&payloads)
        .bind(&created)
        .bind(&expires)
        .execute(&self.pool)
        .await?;

        debug!(
            requested = records.len(),
            inserted = result.rows_affected(),
            "bulk-inserted pending notifications"
        );

        Ok(result.rows_affected())
    }

    async fn insert_one(&self, record: &PendingNotification) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_notifications (
                id, user_id, model, event_type, payload, created_at, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(&record.user_id)
        .bind(record.model.as_str())
        .bind(record.kind.as_str())
        .bind(&record.payload)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::Duplicate
            } else {
                StorageError::Database(e)
            }
        })?;

        Ok(())
    }

    async fn find_for_user(
        &self,
        user_id: &str,
        model: Option<ModelKind>,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<PendingNotification>> {
        let rows = match model {
            Some(model) => {
                sqlx::query(
                    r#"
                    SELECT id, user_id, model, event_type, payload, created_at, expires_at
                    FROM pending_notifications
                    WHERE user_id = $1 AND expires_at > $2 AND model = $3
                    ORDER BY created_at ASC
                    "#,
                )
                .bind(user_id)
                .bind(now)
                .bind(model.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, user_id, model, event_type, payload, created_at, expires_at
                    FROM pending_notifications
                    WHERE user_id = $1 AND expires_at > $2
                    ORDER BY created_at ASC
                    "#,
                )
                .bind(user_id)
                .bind(now)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(Self::collect_records(rows)?)
    }

    async fn find_all_pending(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<PendingNotification>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, model, event_type, payload, created_at, expires_at
            FROM pending_notifications
            WHERE expires_at > $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(Self::collect_records(rows)?)
    }

    async fn delete_ids(&self, user_id: &str, ids: &[Uuid]) -> StorageResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            DELETE FROM pending_notifications
            WHERE user_id = $1 AND id = ANY($2::uuid[])
            "#,
        )
        .bind(user_id)
        .bind(ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_for_user(
        &self,
        user_id: &str,
        model: Option<ModelKind>,
    ) -> StorageResult<u64> {
        let result = match model {
            Some(model) => {
                sqlx::query(
                    r#"
                    DELETE FROM pending_notifications
                    WHERE user_id = $1 AND model = $2
                    "#,
                )
                .bind(user_id)
                .bind(model.as_str())
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    DELETE FROM pending_notifications
                    WHERE user_id = $1
                    "#,
                )
                .bind(user_id)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM pending_notifications
            WHERE expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
