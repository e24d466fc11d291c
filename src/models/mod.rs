use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::realtime::Envelope;

/// Top-level event kind carried on every push frame
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Urgent, user-facing alert
    Alarm,
    /// Standard notification
    Notification,
    /// Informational domain event
    Event,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Alarm => "alarm",
            EventKind::Notification => "notification",
            EventKind::Event => "event",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "alarm" => Some(EventKind::Alarm),
            "notification" => Some(EventKind::Notification),
            "event" => Some(EventKind::Event),
            _ => None,
        }
    }
}

/// Domain model a notification originates from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Community notice board post
    Notice,
    /// Resident poll
    Poll,
    /// Maintenance complaint
    Complaint,
    /// Comment on any of the above
    Comment,
    /// Facility or service request
    Request,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Notice => "notice",
            ModelKind::Poll => "poll",
            ModelKind::Complaint => "complaint",
            ModelKind::Comment => "comment",
            ModelKind::Request => "request",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "notice" => Some(ModelKind::Notice),
            "poll" => Some(ModelKind::Poll),
            "complaint" => Some(ModelKind::Complaint),
            "comment" => Some(ModelKind::Comment),
            "request" => Some(ModelKind::Request),
            _ => None,
        }
    }
}

/// Connection role used for targeted fan-out
///
/// `Resident` and `Manager` are scoped to an apartment complex; `Admin`
/// connections carry no apartment scope and feed the global-role axis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Resident,
    Manager,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Resident => "resident",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "resident" => Some(Role::Resident),
            "manager" => Some(Role::Manager),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Durable backlog record for a notification that had no live recipient
///
/// The record id is the envelope id of the original push, so a client can
/// deduplicate a live delivery against a later redelivery of the same event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingNotification {
    pub id: Uuid,
    pub user_id: String,
    pub model: ModelKind,
    pub kind: EventKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingNotification {
    /// Build the durable mirror of an envelope for one recipient.
    ///
    /// `ttl_days` must be positive; anything else falls back to seven days so
    /// `expires_at` always lands strictly after `created_at`.
    pub fn from_envelope(
        user_id: &str,
        model: ModelKind,
        envelope: &Envelope,
        ttl_days: i64,
    ) -> Self {
        let ttl_days = if ttl_days > 0 { ttl_days } else { 7 };
        let created_at = Utc::now();

        PendingNotification {
            id: envelope.id,
            user_id: user_id.to_string(),
            model,
            kind: envelope.kind,
            payload: envelope.data.clone(),
            created_at,
            expires_at: created_at + Duration::days(ttl_days),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Rebuild the wire envelope for redelivery, flagged as missed.
    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            id: self.id,
            kind: self.kind,
            model: Some(self.model),
            data: self.payload.clone(),
            missed: Some(true),
            timestamp: self.created_at,
        }
    }
}

/// Point-in-time metadata for one live connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionInfo {
    pub user_id: String,
    pub device_id: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apartment_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Aggregated view of the registry for the stats endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub connected_users: usize,
    pub by_role: HashMap<String, usize>,
    pub by_apartment: HashMap<String, usize>,
}
