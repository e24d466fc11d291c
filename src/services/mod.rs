pub mod dispatcher;
pub mod pending_store;
pub mod redelivery;

pub use dispatcher::{
    DispatchOutcome, InMemoryEventManager, NotificationDispatcher, NotificationEventManager,
};
pub use pending_store::PendingNotificationStore;
pub use redelivery::RedeliveryScheduler;
