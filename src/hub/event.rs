//! Lifecycle events fanned out to subscribers.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::mail::MessageSummary;

/// A message lifecycle event.
///
/// Serializes as `{"type": ..., "data": ...}` for transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// A message was stored.
    Arrival(MessageSummary),
    /// A single message was deleted.
    Removed {
        /// ID of the deleted message.
        id: i64,
    },
    /// Every message was deleted.
    Cleared,
}

impl HubEvent {
    /// Wire name of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            HubEvent::Arrival(_) => "email.new",
            HubEvent::Removed { .. } => "email.deleted",
            HubEvent::Cleared => "emails.cleared",
        }
    }
}

#[derive(Serialize)]
struct RemovedData {
    id: i64,
}

#[derive(Serialize)]
struct EmptyData {}

impl Serialize for HubEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", self.kind())?;
        match self {
            HubEvent::Arrival(summary) => map.serialize_entry("data", summary)?,
            HubEvent::Removed { id } => map.serialize_entry("data", &RemovedData { id: *id })?,
            HubEvent::Cleared => map.serialize_entry("data", &EmptyData {})?,
        }
        map.end()
    }
}
