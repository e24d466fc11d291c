use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::metrics;
use crate::models::ModelKind;
use crate::realtime::{ConnectionRegistry, Envelope};
use crate::services::PendingNotificationStore;

/// Domain-side collaborator that owns notification events and read receipts.
///
/// The push service consumes this port; the back office implements it over
/// its own tables.
#[async_trait]
pub trait NotificationEventManager: Send + Sync {
    /// Record the domain event behind a dispatch. Returns its id.
    async fn create_event(
        &self,
        apartment_id: &str,
        model: ModelKind,
        payload: &Value,
    ) -> AppResult<Uuid>;

    /// Resolve the users an apartment-wide dispatch addresses.
    async fn resolve_recipients(&self, apartment_id: &str) -> AppResult<Vec<String>>;

    /// Record an unread receipt per recipient for the event.
    async fn create_receipts(&self, event_id: Uuid, user_ids: &[String]) -> AppResult<()>;
}

/// Counts returned from one dispatch: sinks written live, users queued for
/// redelivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub queued: usize,
}

/// Feeds the push system from the domain side: live push to connected users,
/// durable backlog mirror for everyone else.
pub struct NotificationDispatcher {
    registry: ConnectionRegistry,
    store: Arc<PendingNotificationStore>,
    events: Arc<dyn NotificationEventManager>,
}

impl NotificationDispatcher {
    pub fn new(
        registry: ConnectionRegistry,
        store: Arc<PendingNotificationStore>,
        events: Arc<dyn NotificationEventManager>,
    ) -> Self {
        NotificationDispatcher {
            registry,
            store,
            events,
        }
    }

    /// Push an envelope to one user. When no sink accepts the write the
    /// envelope is mirrored to the backlog instead, so the redelivery loop
    /// picks it up on the next reconnect.
    pub async fn dispatch_to_user(
        &self,
        user_id: &str,
        model: ModelKind,
        envelope: &Envelope,
    ) -> DispatchOutcome {
        let mut failures = 0u64;
        let delivered = self
            .registry
            .send_to_user_with(user_id, envelope, |failure| {
                failures += 1;
                warn!(
                    user_id = %failure.user_id,
                    device_id = %failure.device_id,
                    error = %failure.error,
                    "live push failed for one connection"
                );
            })
            .await;
        if failures > 0 {
            metrics::record_delivery_failures(failures);
        }

        if delivered == 0 {
            self.store.save(user_id, model, envelope).await;
            debug!(
                user_id = %user_id,
                notification_id = %envelope.id,
                "user offline, queued notification for redelivery"
            );
            DispatchOutcome {
                delivered: 0,
                queued: 1,
            }
        } else {
            metrics::record_delivered(delivered as u64);
            DispatchOutcome {
                delivered,
                queued: 0,
            }
        }
    }

    /// Dispatch an envelope to every member of an apartment complex.
    ///
    /// The domain event and its per-recipient receipts are created first, so
    /// the back office sees the notification even if every push fails.
    pub async fn dispatch_to_apartment(
        &self,
        apartment_id: &str,
        model: ModelKind,
        envelope: &Envelope,
    ) -> AppResult<DispatchOutcome> {
        let event_id = self
            .events
            .create_event(apartment_id, model, &envelope.data)
            .await?;
        let recipients = self.events.resolve_recipients(apartment_id).await?;
        if recipients.is_empty() {
            debug!(apartment_id = %apartment_id, "apartment dispatch found no recipients");
            return Ok(DispatchOutcome::default());
        }
        self.events.create_receipts(event_id, &recipients).await?;

        let mut delivered = 0usize;
        let mut offline: Vec<String> = Vec::new();
        for user_id in &recipients {
            let sent = self.registry.send_to_user(user_id, envelope).await;
            if sent > 0 {
                delivered += sent;
            } else {
                offline.push(user_id.clone());
            }
        }

        let queued = offline.len();
        if !offline.is_empty() {
            self.store.save_many(&offline, model, envelope).await;
        }
        if delivered > 0 {
            metrics::record_delivered(delivered as u64);
        }

        info!(
            apartment_id = %apartment_id,
            event_id = %event_id,
            recipients = recipients.len(),
            delivered,
            queued,
            "dispatched notification to apartment"
        );
        Ok(DispatchOutcome { delivered, queued })
    }
}

/// In-memory event manager: the standalone binary's default wiring and the
/// twin the hermetic test suite runs against. Deployments embedding the
/// library supply their own implementation backed by the domain tables.
#[derive(Default)]
pub struct InMemoryEventManager {
    recipients: RwLock<HashMap<String, Vec<String>>>,
    created: RwLock<Vec<(Uuid, String, ModelKind)>>,
    receipts: RwLock<Vec<(Uuid, Vec<String>)>>,
}

impl InMemoryEventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_recipients(&self, apartment_id: &str, user_ids: &[&str]) {
        let mut guard = self.recipients.write().await;
        guard.insert(
            apartment_id.to_string(),
            user_ids.iter().map(|id| id.to_string()).collect(),
        );
    }

    pub async fn created_events(&self) -> Vec<(Uuid, String, ModelKind)> {
        self.created.read().await.clone()
    }

    pub async fn recorded_receipts(&self) -> Vec<(Uuid, Vec<String>)> {
        self.receipts.read().await.clone()
    }
}

#[async_trait]
impl NotificationEventManager for InMemoryEventManager {
    async fn create_event(
        &self,
        apartment_id: &str,
        model: ModelKind,
        _payload: &Value,
    ) -> AppResult<Uuid> {
        let event_id = Uuid::new_v4();
        self.created
            .write()
            .await
            .push((event_id, apartment_id.to_string(), model));
        Ok(event_id)
    }

    async fn resolve_recipients(&self, apartment_id: &str) -> AppResult<Vec<String>> {
        let guard = self.recipients.read().await;
        Ok(guard.get(apartment_id).cloned().unwrap_or_default())
    }

    async fn create_receipts(&self, event_id: Uuid, user_ids: &[String]) -> AppResult<()> {
        self.receipts
            .write()
            .await
            .push((event_id, user_ids.to_vec()));
        Ok(())
    }
}
