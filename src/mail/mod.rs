//! Mail module for mailsink.
//!
//! This module provides the captured-message model and its persistence:
//! - MIME decoding of raw SMTP payloads
//! - Message and attachment storage
//! - Filtered listing, search and eviction
//! - Sanitizing HTML bodies for display

mod parser;
mod repository;
mod sanitizer;
mod types;

pub use parser::{parse_address_list, parse_message, DecodeError, MAX_PART_DEPTH};
pub use repository::MessageRepository;
pub use sanitizer::sanitize_markup;
pub use types::{
    Attachment, AttachmentMeta, HeaderFields, Message, MessageFilter, MessagePage, MessageStats,
    MessageSummary, NewAttachment, NewMessage, Page, DEFAULT_ATTACHMENT_NAME, DEFAULT_PAGE_LIMIT,
    MAX_PAGE_LIMIT, MIN_PAGE_LIMIT,
};
