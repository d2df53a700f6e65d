//! MIME decoder for captured messages.
//!
//! Turns the raw bytes of one SMTP `DATA` payload into a [`NewMessage`]:
//! headers, sender and recipient lists, the plain and HTML bodies, and every
//! attachment. The part tree is walked recursively; each part is classified
//! as a container, a text body, or an attachment.

use chrono::Utc;
use mailparse::body::Body;
use mailparse::{addrparse, DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use thiserror::Error;
use tracing::trace;

use super::types::{HeaderFields, NewAttachment, NewMessage, DEFAULT_ATTACHMENT_NAME};

/// Deepest multipart nesting accepted before the message is rejected.
pub const MAX_PART_DEPTH: usize = 32;

/// Structural problems that make a message undecodable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Nothing but whitespace was received.
    #[error("message is empty")]
    Empty,

    /// The header block or MIME framing could not be parsed.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A multipart part declared no boundary.
    #[error("multipart part {0} has no boundary parameter")]
    MissingBoundary(String),

    /// Multipart containers nested deeper than [`MAX_PART_DEPTH`].
    #[error("multipart nesting exceeds {0} levels")]
    TooDeep(usize),
}

/// Which body slot a text part fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextSlot {
    Plain,
    Markup,
}

/// Classification of a single MIME part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartKind {
    Container,
    Text(TextSlot),
    Attachment,
}

/// Bodies and attachments accumulated across the part tree.
#[derive(Debug, Default)]
struct DecodedBody {
    plain: String,
    markup: String,
    attachments: Vec<NewAttachment>,
}

/// Decode a raw message.
///
/// `received_at` is set to the current time; callers that assign receive
/// times themselves overwrite it.
pub fn parse_message(raw: &[u8]) -> Result<NewMessage, DecodeError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }

    let parsed = mailparse::parse_mail(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let mut header_fields = HeaderFields::new();
    for header in &parsed.headers {
        header_fields.append(header.get_key(), unfold(header.get_value_raw()));
    }

    let headers = &parsed.headers;
    let subject = headers.get_first_value("Subject").unwrap_or_default();
    let external_id = headers
        .get_first_value("Message-ID")
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());
    let sender = headers
        .get_first_value("From")
        .map(|from| parse_sender(&from))
        .unwrap_or_default();
    let recipients = address_header(headers, "To");
    let cc_recipients = address_header(headers, "Cc");
    let bcc_recipients = address_header(headers, "Bcc");

    let mut body = DecodedBody::default();
    decode_part(&parsed, 0, &mut body)?;

    trace!(
        attachments = body.attachments.len(),
        plain = body.plain.len(),
        markup = body.markup.len(),
        "decoded message"
    );

    Ok(NewMessage {
        external_id,
        sender,
        recipients,
        cc_recipients,
        bcc_recipients,
        subject,
        plain_body: body.plain,
        markup_body: body.markup,
        header_fields,
        attachments: body.attachments,
        byte_size: raw.len() as i64,
        received_at: Utc::now(),
    })
}

/// Walk one part and everything below it.
fn decode_part(part: &ParsedMail<'_>, depth: usize, out: &mut DecodedBody) -> Result<(), DecodeError> {
    if depth > MAX_PART_DEPTH {
        return Err(DecodeError::TooDeep(MAX_PART_DEPTH));
    }

    match classify(part) {
        PartKind::Container => {
            if !part.ctype.params.contains_key("boundary") {
                return Err(DecodeError::MissingBoundary(part.ctype.mimetype.clone()));
            }
            for child in &part.subparts {
                decode_part(child, depth + 1, out)?;
            }
        }
        PartKind::Text(slot) => {
            // Last writer wins when a slot appears more than once.
            let text = part
                .get_body()
                .unwrap_or_else(|_| String::from_utf8_lossy(&undecoded_body(part)).into_owned());
            match slot {
                TextSlot::Plain => out.plain = text,
                TextSlot::Markup => out.markup = text,
            }
        }
        PartKind::Attachment => {
            let payload = part.get_body_raw().unwrap_or_else(|_| undecoded_body(part));
            out.attachments.push(NewAttachment::new(
                attachment_filename(part),
                part.ctype.mimetype.clone(),
                payload,
            ));
        }
    }

    Ok(())
}

fn classify(part: &ParsedMail<'_>) -> PartKind {
    let disposition = part.get_content_disposition();
    let has_filename = disposition
        .params
        .get("filename")
        .is_some_and(|name| !name.trim().is_empty());

    let is_attachment = match disposition.disposition {
        DispositionType::Attachment => true,
        DispositionType::Inline => has_filename,
        _ => false,
    };
    if is_attachment {
        return PartKind::Attachment;
    }

    let mimetype = part.ctype.mimetype.to_ascii_lowercase();
    if mimetype.starts_with("multipart/") {
        PartKind::Container
    } else if mimetype == "text/plain" {
        PartKind::Text(TextSlot::Plain)
    } else if mimetype == "text/html" {
        PartKind::Text(TextSlot::Markup)
    } else {
        PartKind::Attachment
    }
}

/// Disposition `filename`, then content-type `name`, then a placeholder.
fn attachment_filename(part: &ParsedMail<'_>) -> String {
    let disposition = part.get_content_disposition();
    let name = [
        disposition.params.get("filename"),
        part.ctype.params.get("name"),
    ]
    .into_iter()
    .flatten()
    .map(|name| name.trim())
    .find(|name| !name.is_empty())
    .unwrap_or(DEFAULT_ATTACHMENT_NAME)
    .to_string();
    name
}

/// Body bytes with the transfer encoding left in place.
fn undecoded_body(part: &ParsedMail<'_>) -> Vec<u8> {
    match part.get_body_encoded() {
        Body::Base64(body) | Body::QuotedPrintable(body) => body.get_raw().to_vec(),
        Body::SevenBit(body) | Body::EightBit(body) => body.get_raw().to_vec(),
        Body::Binary(body) => body.get_raw().to_vec(),
    }
}

fn unfold(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Bare address of the first mailbox in a `From` header.
fn parse_sender(value: &str) -> String {
    parse_address_list(value)
        .into_iter()
        .next()
        .unwrap_or_else(|| value.trim().to_string())
}

fn address_header(headers: &[mailparse::MailHeader<'_>], name: &str) -> Vec<String> {
    headers
        .get_first_value(name)
        .map(|value| parse_address_list(&value))
        .unwrap_or_default()
}

/// Parse an address list, dropping display names and flattening groups.
///
/// Falls back to a plain comma split when the list does not parse.
pub fn parse_address_list(value: &str) -> Vec<String> {
    match addrparse(value) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(single) => vec![single.addr.clone()],
                MailAddr::Group(group) => group.addrs.iter().map(|s| s.addr.clone()).collect(),
            })
            .filter(|addr| !addr.trim().is_empty())
            .collect(),
        Err(_) => value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect(),
    }
}
