pub mod envelope;
pub mod registry;
pub mod sink;

pub use envelope::{Envelope, SSE_HEARTBEAT_FRAME};
pub use registry::{
    BroadcastOptions, Connection, ConnectionId, ConnectionRegistry, DeliveryFailure,
};
pub use sink::{EventSink, Frame, SinkError, SsePayload, SseReceiver, SseSender, SseSink};
