use actix_web::web::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use super::envelope::{Envelope, SSE_HEARTBEAT_FRAME};

/// One chunk of an SSE response body. `None` is the shutdown sentinel that
/// ends the stream from the server side.
pub type SsePayload = Option<Bytes>;

/// Type alias for the channel half held by a sink
pub type SseSender = mpsc::UnboundedSender<SsePayload>;

/// Type alias for the channel half driving the HTTP response body
pub type SseReceiver = mpsc::UnboundedReceiver<SsePayload>;

#[derive(Debug, Error)]
pub enum SinkError {
    /// The peer is gone; the write side observed a closed channel
    #[error("connection closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A frame the registry can hand to any sink
#[derive(Debug, Clone)]
pub enum Frame {
    Event(Envelope),
    Heartbeat,
}

/// Write side of one live connection.
///
/// Implementations must be cheap to call and must never block: fan-out loops
/// write to many sinks in sequence with no lock held.
pub trait EventSink: Send + Sync {
    fn write(&self, frame: &Frame) -> Result<(), SinkError>;

    /// Terminate the connection from the server side. Idempotent.
    fn close(&self);
}

/// SSE sink backed by an unbounded channel; the receiver half becomes the
/// streaming HTTP response body.
pub struct SseSink {
    tx: SseSender,
}

impl SseSink {
    pub fn channel() -> (Self, SseReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SseSink { tx }, rx)
    }
}

impl EventSink for SseSink {
    fn write(&self, frame: &Frame) -> Result<(), SinkError> {
        let text = match frame {
            Frame::Event(envelope) => envelope.sse_frame()?,
            Frame::Heartbeat => SSE_HEARTBEAT_FRAME.to_string(),
        };

        self.tx
            .send(Some(Bytes::from(text)))
            .map_err(|_| SinkError::Closed)
    }

    fn close(&self) {
        // The sentinel ends the response body; a closed channel means the
        // client already disconnected.
        let _ = self.tx.send(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelKind;
    use serde_json::json;

    #[test]
    fn test_write_event_produces_sse_frame() {
        let (sink, mut rx) = SseSink::channel();
        let envelope = Envelope::notification(ModelKind::Notice, json!({ "n": 1 }));

        sink.write(&Frame::Event(envelope)).unwrap();

        let payload = rx.try_recv().unwrap().unwrap();
        let text = String::from_utf8(payload.to_vec()).unwrap();
        assert!(text.starts_with("event: notification\ndata: "));
        assert!(text.ends_with("\n\n"));
    }

    #[test]
    fn test_write_heartbeat_is_comment_only() {
        let (sink, mut rx) = SseSink::channel();

        sink.write(&Frame::Heartbeat).unwrap();

        let payload = rx.try_recv().unwrap().unwrap();
        assert_eq!(payload, Bytes::from_static(SSE_HEARTBEAT_FRAME.as_bytes()));
    }

    #[test]
    fn test_close_sends_shutdown_sentinel() {
        let (sink, mut rx) = SseSink::channel();

        sink.close();

        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[test]
    fn test_write_after_receiver_dropped_reports_closed() {
        let (sink, rx) = SseSink::channel();
        drop(rx);

        let err = sink.write(&Frame::Heartbeat).unwrap_err();
        assert!(matches!(err, SinkError::Closed));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (sink, mut rx) = SseSink::channel();

        sink.close();
        sink.close();

        assert_eq!(rx.try_recv().unwrap(), None);
        assert_eq!(rx.try_recv().unwrap(), None);
    }
}
