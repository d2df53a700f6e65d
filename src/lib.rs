//! mailsink - a developer SMTP capture server.
//!
//! Every message delivered over SMTP is decoded, stored in SQLite with
//! full-text search, and announced to live observers. Stored messages are
//! served through a JSON API and a WebSocket event stream.

pub mod config;
pub mod db;
pub mod error;
pub mod hub;
pub mod ingest;
pub mod logging;
pub mod mail;
pub mod retention;
pub mod smtp;
pub mod web;

pub use config::Config;
pub use db::{Database, SearchMode};
pub use error::{MailsinkError, Result};
pub use hub::{EventSink, Hub, HubEvent, HubHandle, Subscription};
pub use ingest::{Envelope, Ingestor};
pub use mail::{
    parse_message, DecodeError, Message, MessageFilter, MessageRepository, NewMessage, Page,
};
pub use retention::{start_retention, RetentionManager, SweepReport};
pub use smtp::SmtpServer;
pub use web::WebServer;
