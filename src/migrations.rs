use sqlx::{Pool, Postgres};

// SQL migrations embedded at compile time
const MIG_0001: &str = include_str!("../migrations/0001_create_pending_notifications.sql");

pub async fn run_all(db: &Pool<Postgres>) -> Result<(), sqlx::Error> {
    for (i, sql) in [MIG_0001].into_iter().enumerate() {
        let label = i + 1;
        match sqlx::query(sql).execute(db).await {
            Ok(_) => tracing::info!(migration = %label, "terrace-push migration applied"),
            Err(e) => {
                tracing::warn!(migration = %label, error = %e, "migration may have been applied already");
            }
        }
    }
    Ok(())
}
