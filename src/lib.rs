pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod realtime;
pub mod storage;
pub mod services;
pub mod handlers;
pub mod metrics;
pub mod migrations;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use realtime::{BroadcastOptions, Connection, ConnectionRegistry, Envelope, EventSink, SseSink};
pub use services::{NotificationDispatcher, PendingNotificationStore, RedeliveryScheduler};
pub use storage::{NotificationStorage, PgNotificationStorage};
