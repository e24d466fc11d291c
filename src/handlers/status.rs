use std::sync::Arc;

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::models::{EventKind, ModelKind, Role};
use crate::realtime::{BroadcastOptions, ConnectionRegistry, Envelope};
use crate::services::{DispatchOutcome, NotificationDispatcher};

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub model: Option<ModelKind>,
    pub data: Value,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub model: Option<ModelKind>,
    pub data: Value,
    pub role: Option<Role>,
    pub apartment_id: Option<String>,
    pub exclude_user: Option<String>,
    pub exclude_device: Option<String>,
}

fn build_envelope(kind: EventKind, model: Option<ModelKind>, data: Value) -> Result<Envelope, AppError> {
    match (kind, model) {
        (EventKind::Alarm, Some(model)) => Ok(Envelope::alarm(model, data)),
        (EventKind::Notification, Some(model)) => Ok(Envelope::notification(model, data)),
        (EventKind::Event, _) => Ok(Envelope::event(data)),
        (kind, None) => Err(AppError::BadRequest(format!(
            "{} notifications require a model",
            kind.as_str()
        ))),
    }
}

/// Connection status for one user
///
/// Endpoint: GET /api/v1/push/status/{user_id}
pub async fn push_status(
    path: web::Path<String>,
    registry: web::Data<ConnectionRegistry>,
) -> HttpResponse {
    let user_id = path.into_inner();
    let connection_count = registry.connection_count(&user_id).await;

    HttpResponse::Ok().json(json!({
        "user_id": user_id,
        "connected": connection_count > 0,
        "connection_count": connection_count
    }))
}

/// Aggregated registry counters
///
/// Endpoint: GET /api/v1/push/stats
pub async fn push_stats(registry: web::Data<ConnectionRegistry>) -> HttpResponse {
    let stats = registry.connection_stats().await;
    HttpResponse::Ok().json(stats)
}

/// Metadata for every live connection
///
/// Endpoint: GET /api/v1/push/connections
pub async fn list_connections(registry: web::Data<ConnectionRegistry>) -> HttpResponse {
    let connections = registry.all_connections().await;
    HttpResponse::Ok().json(json!({
        "count": connections.len(),
        "connections": connections
    }))
}

/// Dispatch an envelope to one user, with offline fallback to the backlog
///
/// Endpoint: POST /api/v1/push/notify/{user_id}
pub async fn notify_user(
    path: web::Path<String>,
    registry: web::Data<ConnectionRegistry>,
    dispatcher: web::Data<Arc<NotificationDispatcher>>,
    body: web::Json<NotifyRequest>,
) -> Result<HttpResponse, AppError> {
    let user_id = path.into_inner();
    let request = body.into_inner();

    let outcome = match (request.kind, request.model) {
        // plain events are live-only, they are never mirrored to the backlog
        (EventKind::Event, _) => {
            let envelope = Envelope::event(request.data);
            let delivered = registry.send_to_user(&user_id, &envelope).await;
            DispatchOutcome {
                delivered,
                queued: 0,
            }
        }
        (EventKind::Alarm, Some(model)) => {
            let envelope = Envelope::alarm(model, request.data);
            dispatcher.dispatch_to_user(&user_id, model, &envelope).await
        }
        (EventKind::Notification, Some(model)) => {
            let envelope = Envelope::notification(model, request.data);
            dispatcher.dispatch_to_user(&user_id, model, &envelope).await
        }
        (kind, None) => {
            return Err(AppError::BadRequest(format!(
                "{} notifications require a model",
                kind.as_str()
            )));
        }
    };

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "user_id": user_id,
        "delivered": outcome.delivered,
        "queued": outcome.queued
    })))
}

/// Fan an envelope out to a slice of the live connections
///
/// Endpoint: POST /api/v1/push/broadcast
///
/// `role` and `apartment_id` select the broadcast axis; the exclusions are
/// forwarded as filters.
pub async fn broadcast(
    registry: web::Data<ConnectionRegistry>,
    body: web::Json<BroadcastRequest>,
) -> Result<HttpResponse, AppError> {
    let request = body.into_inner();
    let envelope = build_envelope(request.kind, request.model, request.data)?;
    let opts = BroadcastOptions {
        exclude_user: request.exclude_user,
        exclude_device: request.exclude_device,
        only_role: None,
    };

    let delivered = match (request.role, request.apartment_id.as_deref()) {
        (Some(role), Some(apartment_id)) => {
            registry
                .broadcast_by_role_and_apartment(role, apartment_id, &envelope, &opts)
                .await
        }
        (None, Some(apartment_id)) => {
            registry
                .broadcast_to_apartment(apartment_id, &envelope, &opts)
                .await
        }
        (Some(role), None) => registry.broadcast_by_role(role, &envelope, &opts).await,
        (None, None) => registry.broadcast_all(&envelope, &opts).await,
    };

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "delivered": delivered
    })))
}
