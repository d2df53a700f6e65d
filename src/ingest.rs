//! Ingestion of raw messages.
//!
//! Decodes a raw payload, fills gaps from the SMTP envelope, assigns the
//! receive time, stores the result and announces the arrival.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::Database;
use crate::hub::{EventSink, HubEvent};
use crate::mail::{parse_message, MessageRepository, MessageSummary};
use crate::Result;

/// SMTP envelope of one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// `MAIL FROM` address.
    pub sender: String,
    /// `RCPT TO` addresses, in order.
    pub recipients: Vec<String>,
}

impl Envelope {
    /// Create an envelope.
    pub fn new(sender: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            sender: sender.into(),
            recipients,
        }
    }
}

/// Turns raw payloads into stored messages.
pub struct Ingestor {
    db: Database,
    events: Arc<dyn EventSink>,
    last_received: Mutex<DateTime<Utc>>,
}

impl Ingestor {
    /// Create an ingestor that stores into `db` and reports to `events`.
    pub fn new(db: Database, events: Arc<dyn EventSink>) -> Self {
        Self {
            db,
            events,
            last_received: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    /// Decode, store and announce one message. Returns the new message ID.
    ///
    /// The decoded `From` and `To` fall back to the envelope when empty.
    /// Receive times never go backwards across successive calls.
    pub async fn ingest(&self, raw: &[u8], envelope: &Envelope) -> Result<i64> {
        let mut message = parse_message(raw).inspect_err(|e| {
            warn!(error = %e, size = raw.len(), "Rejecting undecodable message");
        })?;

        if message.sender.is_empty() {
            message.sender = envelope.sender.clone();
        }
        if message.recipients.is_empty() {
            message.recipients = envelope.recipients.clone();
        }

        let (id, received_at) = {
            let mut last = self.last_received.lock().await;
            // The store keeps microseconds; truncate so the event matches it.
            let received_at = Utc::now().trunc_subsecs(6).max(*last);
            message.received_at = received_at;

            let id = MessageRepository::new(&self.db).save(&message).await?;
            *last = received_at;
            (id, received_at)
        };

        info!(
            id,
            from = %message.sender,
            to = ?message.recipients,
            subject = %message.subject,
            size = message.byte_size,
            "Message captured"
        );

        self.events.publish(HubEvent::Arrival(MessageSummary {
            id,
            sender: message.sender,
            recipients: message.recipients,
            subject: message.subject,
            received_at,
        }));

        Ok(id)
    }
}
