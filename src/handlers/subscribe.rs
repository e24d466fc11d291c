use std::sync::Arc;

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::metrics;
use crate::models::Role;
use crate::realtime::{Connection, ConnectionRegistry, Envelope, Frame, SseSink};
use crate::services::PendingNotificationStore;

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    pub device_id: Option<String>,
    pub role: Option<String>,
    pub apartment_id: Option<String>,
}

/// Attach a client to the push stream
///
/// Endpoint: GET /api/v1/push/subscribe/{user_id}
///
/// Registers the connection, replays the user's backlog as one missed-batch
/// envelope, then streams live frames until the peer goes away or the idle
/// ceiling closes the connection.
pub async fn subscribe(
    path: web::Path<String>,
    query: web::Query<SubscribeQuery>,
    registry: web::Data<ConnectionRegistry>,
    store: web::Data<Arc<PendingNotificationStore>>,
    config: web::Data<Config>,
) -> Result<HttpResponse, AppError> {
    let user_id = path.into_inner();
    let role = match query.role.as_deref() {
        Some(raw) => {
            Role::parse(raw).ok_or_else(|| AppError::BadRequest(format!("unknown role: {}", raw)))?
        }
        None => Role::Resident,
    };
    let device_id = query
        .device_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (sink, rx) = SseSink::channel();
    let connection = Connection::new(&device_id, role, query.apartment_id.clone(), Arc::new(sink));
    registry.add_client(&user_id, connection.clone()).await;
    metrics::client_connected();
    info!(
        user_id = %user_id,
        device_id = %device_id,
        role = %role.as_str(),
        "sse client attached"
    );

    replay_backlog(&store, &connection, &user_id).await;
    spawn_connection_keeper(
        registry.get_ref().clone(),
        connection,
        user_id,
        device_id,
        &config,
    );

    let stream = UnboundedReceiverStream::new(rx)
        .take_while(|payload| payload.is_some())
        .filter_map(|payload| payload.map(Ok::<_, actix_web::Error>));

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(stream))
}

/// Replay everything queued while the user was offline as a single
/// missed-batch frame, and delete exactly what was replayed once the write
/// is accepted.
async fn replay_backlog(
    store: &PendingNotificationStore,
    connection: &Connection,
    user_id: &str,
) {
    let backlog = store.pending_for(user_id, None).await;
    if backlog.is_empty() {
        return;
    }

    let mut items = Vec::with_capacity(backlog.len());
    let mut ids = Vec::with_capacity(backlog.len());
    for record in &backlog {
        match serde_json::to_value(record.to_envelope()) {
            Ok(value) => {
                items.push(value);
                ids.push(record.id);
            }
            Err(err) => {
                warn!(
                    error = %err,
                    notification_id = %record.id,
                    "failed to serialize backlog record for replay"
                );
            }
        }
    }
    if items.is_empty() {
        return;
    }

    let replay = Envelope::missed_batch(items);
    match connection.write(&Frame::Event(replay)) {
        Ok(()) => {
            let removed = store.delete_ids(user_id, &ids).await;
            info!(
                user_id = %user_id,
                replayed = ids.len(),
                removed,
                "replayed missed notifications"
            );
        }
        Err(err) => {
            warn!(
                user_id = %user_id,
                error = %err,
                "missed-notification replay write failed, backlog kept"
            );
        }
    }
}

/// Per-connection task: comment heartbeats on a fixed cadence plus the idle
/// ceiling. Whichever fires first tears the connection down.
fn spawn_connection_keeper(
    registry: ConnectionRegistry,
    connection: Connection,
    user_id: String,
    device_id: String,
    config: &Config,
) {
    let heartbeat_interval = config.push.heartbeat_interval();
    let idle_timeout = config.push.idle_timeout();

    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle_deadline = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle_deadline);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if connection.write(&Frame::Heartbeat).is_err() {
                        debug!(
                            user_id = %user_id,
                            device_id = %device_id,
                            "heartbeat write failed, peer gone"
                        );
                        break;
                    }
                }
                _ = &mut idle_deadline => {
                    info!(
                        user_id = %user_id,
                        device_id = %device_id,
                        "idle ceiling reached, closing connection"
                    );
                    break;
                }
            }
        }

        registry
            .remove_client(&user_id, &device_id, &connection)
            .await;
        connection.close();
        metrics::client_disconnected();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PushConfig;
    use crate::models::ModelKind;
    use crate::realtime::SseReceiver;
    use crate::storage::InMemoryNotificationStorage;
    use serde_json::json;

    fn store_with_memory() -> (Arc<PendingNotificationStore>, Arc<InMemoryNotificationStorage>) {
        let storage = Arc::new(InMemoryNotificationStorage::new());
        let store = Arc::new(PendingNotificationStore::new(
            storage.clone(),
            &PushConfig::default(),
        ));
        (store, storage)
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
    async fn test_replay_sends_one_missed_batch_and_clears_backlog() {
        let (store, storage) = store_with_memory();
        let first = Envelope::notification(ModelKind::Notice, json!({"n": 1}));
        let second = Envelope::notification(ModelKind::Poll, json!({"p": 2}));
        store.save("u1", ModelKind::Notice, &first).await;
        store.save("u1", ModelKind::Poll, &second).await;

        let (connection, mut rx) = connection_with_sink("device-a");
        replay_backlog(&store, &connection, "u1").await;

        let frame = recv_text(&mut rx);
        assert!(frame.starts_with("event: notification\n"));
        assert!(frame.contains("\"missed\":true"));
        assert!(frame.contains(&first.id.to_string()));
        assert!(frame.contains(&second.id.to_string()));
        assert!(rx.try_recv().is_err());
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_replay_with_empty_backlog_writes_nothing() {
        let (store, _storage) = store_with_memory();
        let (connection, mut rx) = connection_with_sink("device-a");

        replay_backlog(&store, &connection, "u1").await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_replay_write_keeps_the_backlog() {
        let (store, storage) = store_with_memory();
        let envelope = Envelope::notification(ModelKind::Notice, json!({"n": 1}));
        store.save("u1", ModelKind::Notice, &envelope).await;

        let (connection, rx) = connection_with_sink("device-a");
        drop(rx);
        replay_backlog(&store, &connection, "u1").await;

        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_replay_only_touches_that_users_records() {
        let (store, storage) = store_with_memory();
        let envelope = Envelope::notification(ModelKind::Notice, json!({"n": 1}));
        store.save("u1", ModelKind::Notice, &envelope).await;
        store.save("u2", ModelKind::Notice, &envelope).await;

        let (connection, mut rx) = connection_with_sink("device-a");
        replay_backlog(&store, &connection, "u1").await;

        assert!(rx.try_recv().is_ok());
        assert_eq!(storage.len().await, 1);
        assert_eq!(store.pending_for("u2", None).await.len(), 1);
    }
}
