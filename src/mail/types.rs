//! Message types for mailsink.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{MailsinkError, Result};

/// Smallest page size a listing will return.
pub const MIN_PAGE_LIMIT: i64 = 1;

/// Largest page size a listing will return.
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Page size used when the caller does not ask for one.
pub const DEFAULT_PAGE_LIMIT: i64 = 50;

/// Filename used for attachments that carry no name at all.
pub const DEFAULT_ATTACHMENT_NAME: &str = "attachment";

/// Header fields of a message.
///
/// Names compare case-insensitively but keep the casing of their first
/// occurrence. Every value is kept, in the order it appeared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFields {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderFields {
    /// Create an empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `name`.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some((_, values)) => values.push(value),
            None => self.entries.push((name, vec![value])),
        }
    }

    /// All values for `name`, in order.
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }

    /// The first value for `name`.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Iterate over `(name, values)` pairs in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for HeaderFields {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, values) in &self.entries {
            map.serialize_entry(name, values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HeaderFields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct HeaderFieldsVisitor;

        impl<'de> Visitor<'de> for HeaderFieldsVisitor {
            type Value = HeaderFields;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of header names to value lists")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut fields = HeaderFields::new();
                while let Some((name, values)) = access.next_entry::<String, Vec<String>>()? {
                    for value in values {
                        fields.append(name.clone(), value);
                    }
                }
                Ok(fields)
            }
        }

        deserializer.deserialize_map(HeaderFieldsVisitor)
    }
}

/// Attachment metadata (no payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    /// Attachment ID.
    pub id: i64,
    /// Owning message ID.
    #[serde(skip)]
    pub message_id: i64,
    /// File name.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Payload size in bytes.
    #[serde(rename = "size")]
    pub byte_size: i64,
}

/// Attachment with its payload.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Metadata.
    pub meta: AttachmentMeta,
    /// Raw decoded bytes.
    pub payload: Vec<u8>,
}

/// Attachment produced by the decoder, not yet stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
    /// File name.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Raw decoded bytes.
    pub payload: Vec<u8>,
}

impl NewAttachment {
    /// Create a new attachment.
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            payload: payload.into(),
        }
    }

    /// Payload size in bytes.
    pub fn byte_size(&self) -> i64 {
        self.payload.len() as i64
    }
}

/// A stored message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message ID (assigned by the store).
    pub id: i64,
    /// `Message-ID` header, if present.
    #[serde(rename = "messageId")]
    pub external_id: Option<String>,
    /// Sender address.
    #[serde(rename = "from")]
    pub sender: String,
    /// `To` recipients.
    #[serde(rename = "to")]
    pub recipients: Vec<String>,
    /// `Cc` recipients.
    #[serde(rename = "cc", skip_serializing_if = "Vec::is_empty")]
    pub cc_recipients: Vec<String>,
    /// `Bcc` recipients.
    #[serde(rename = "bcc", skip_serializing_if = "Vec::is_empty")]
    pub bcc_recipients: Vec<String>,
    /// Decoded subject.
    pub subject: String,
    /// Plain-text body.
    #[serde(rename = "bodyPlain")]
    pub plain_body: String,
    /// HTML body.
    #[serde(rename = "bodyHTML")]
    pub markup_body: String,
    /// All header fields.
    #[serde(rename = "headers")]
    pub header_fields: HeaderFields,
    /// Attachment metadata.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentMeta>,
    /// Size of the original encoded message.
    #[serde(rename = "size")]
    pub byte_size: i64,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
    /// Read flag.
    #[serde(rename = "read")]
    pub is_read: bool,
}

impl Message {
    /// Summary used for arrival notifications.
    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            id: self.id,
            sender: self.sender.clone(),
            recipients: self.recipients.clone(),
            subject: self.subject.clone(),
            received_at: self.received_at,
        }
    }
}

/// A decoded message ready to be stored.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// `Message-ID` header, if present.
    pub external_id: Option<String>,
    /// Sender address.
    pub sender: String,
    /// `To` recipients.
    pub recipients: Vec<String>,
    /// `Cc` recipients.
    pub cc_recipients: Vec<String>,
    /// `Bcc` recipients.
    pub bcc_recipients: Vec<String>,
    /// Decoded subject.
    pub subject: String,
    /// Plain-text body.
    pub plain_body: String,
    /// HTML body.
    pub markup_body: String,
    /// All header fields.
    pub header_fields: HeaderFields,
    /// Attachments with payloads.
    pub attachments: Vec<NewAttachment>,
    /// Size of the original encoded message.
    pub byte_size: i64,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
}

impl NewMessage {
    /// Create a minimal message.
    pub fn new(
        sender: impl Into<String>,
        recipients: Vec<String>,
        subject: impl Into<String>,
        plain_body: impl Into<String>,
    ) -> Self {
        let plain_body = plain_body.into();
        Self {
            external_id: None,
            sender: sender.into(),
            recipients,
            cc_recipients: Vec::new(),
            bcc_recipients: Vec::new(),
            subject: subject.into(),
            byte_size: plain_body.len() as i64,
            plain_body,
            markup_body: String::new(),
            header_fields: HeaderFields::new(),
            attachments: Vec::new(),
            received_at: Utc::now(),
        }
    }

    /// Set the receive time.
    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// Set the `Message-ID`.
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    /// Set the HTML body.
    pub fn with_markup_body(mut self, markup_body: impl Into<String>) -> Self {
        self.markup_body = markup_body.into();
        self
    }

    /// Add an attachment.
    pub fn with_attachment(mut self, attachment: NewAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// Event payload describing a newly stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    /// Message ID.
    pub id: i64,
    /// Sender address.
    #[serde(rename = "from")]
    pub sender: String,
    /// `To` recipients.
    #[serde(rename = "to")]
    pub recipients: Vec<String>,
    /// Subject.
    pub subject: String,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
}

/// Listing filter. All set predicates must hold.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// Sender substring.
    pub sender: Option<String>,
    /// Recipient substring.
    pub recipient: Option<String>,
    /// Subject substring.
    pub subject: Option<String>,
    /// Received at or after.
    pub received_after: Option<DateTime<Utc>>,
    /// Received at or before.
    pub received_before: Option<DateTime<Utc>>,
}

impl MessageFilter {
    /// Create an empty filter (matches everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by sender substring.
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Filter by recipient substring.
    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Filter by subject substring.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Only messages received at or after `at`.
    pub fn received_after(mut self, at: DateTime<Utc>) -> Self {
        self.received_after = Some(at);
        self
    }

    /// Only messages received at or before `at`.
    pub fn received_before(mut self, at: DateTime<Utc>) -> Self {
        self.received_before = Some(at);
        self
    }
}

/// Pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    limit: i64,
    offset: i64,
}

impl Page {
    /// Build a page, clamping `limit` into
    /// `MIN_PAGE_LIMIT..=MAX_PAGE_LIMIT`.
    ///
    /// A negative offset is rejected.
    pub fn new(limit: i64, offset: i64) -> Result<Self> {
        if offset < 0 {
            return Err(MailsinkError::InvalidArgument(format!(
                "offset must not be negative (got {offset})"
            )));
        }
        Ok(Self {
            limit: limit.clamp(MIN_PAGE_LIMIT, MAX_PAGE_LIMIT),
            offset,
        })
    }

    /// Effective limit.
    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Effective offset.
    pub fn offset(&self) -> i64 {
        self.offset
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

/// One page of messages plus the total number of matches.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    /// Messages on this page.
    #[serde(rename = "emails")]
    pub messages: Vec<Message>,
    /// Matches ignoring pagination.
    pub total: i64,
}

/// Mailbox counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessageStats {
    /// Stored messages.
    #[serde(rename = "totalEmails")]
    pub total: i64,
    /// Messages received since the start of the current UTC day.
    #[serde(rename = "todayCount")]
    pub today: i64,
}

/// Store a timestamp as microseconds since the Unix epoch.
pub(crate) fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

/// Inverse of [`to_micros`].
pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}
