/// Wire format for every frame pushed over a live connection
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{EventKind, ModelKind};

/// Comment-only SSE heartbeat frame; ignored by EventSource clients.
pub const SSE_HEARTBEAT_FRAME: &str = ": ping\n\n";

/// The one message shape shared by live pushes, backlog mirrors and
/// redeliveries.
///
/// `id` is minted once at construction and survives into the durable backlog,
/// so every retransmission of the same event carries the same id and clients
/// can deduplicate the at-least-once stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelKind>,
    /// Always a JSON object or array, never a bare scalar
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missed: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    fn new(kind: EventKind, model: Option<ModelKind>, data: Value) -> Self {
        Envelope {
            id: Uuid::new_v4(),
            kind,
            model,
            data,
            missed: None,
            timestamp: Utc::now(),
        }
    }

    /// Create an alarm envelope
    pub fn alarm(model: ModelKind, data: Value) -> Self {
        Envelope::new(EventKind::Alarm, Some(model), data)
    }

    /// Create a notification envelope
    pub fn notification(model: ModelKind, data: Value) -> Self {
        Envelope::new(EventKind::Notification, Some(model), data)
    }

    /// Create a plain event envelope with no originating model
    pub fn event(data: Value) -> Self {
        Envelope::new(EventKind::Event, None, data)
    }

    /// Create the single batch envelope that replays a user's backlog on
    /// connect. `items` are the serialized envelopes of the backlogged
    /// records.
    pub fn missed_batch(items: Vec<Value>) -> Self {
        let mut envelope = Envelope::new(EventKind::Notification, None, Value::Array(items));
        envelope.missed = Some(true);
        envelope
    }

    /// Flag this envelope as a late delivery
    pub fn with_missed(mut self) -> Self {
        self.missed = Some(true);
        self
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Render the two-line SSE frame: an `event:` line carrying the kind and
    /// a `data:` line carrying the whole envelope as JSON.
    pub fn sse_frame(&self) -> Result<String, serde_json::Error> {
        Ok(format!(
            "event: {}\ndata: {}\n\n",
            self.kind.as_str(),
            self.to_json()?
        ))
    }
}
