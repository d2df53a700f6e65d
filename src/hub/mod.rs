//! Event fanout for mailsink.
//!
//! Lifecycle events (arrival, deletion, bulk clear) are published once and
//! delivered to every live subscriber. Subscribers that fall behind are
//! disconnected instead of slowing anyone else down.

mod broker;
mod event;

pub use broker::{Hub, HubHandle, Subscription};
pub use event::HubEvent;

/// Destination for lifecycle events.
pub trait EventSink: Send + Sync {
    /// Deliver an event. Must not block.
    fn publish(&self, event: HubEvent);
}
