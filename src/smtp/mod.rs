//! SMTP receiver.
//!
//! This module provides the TCP listener and the per-connection protocol
//! handling that feeds captured messages into ingestion.

mod command;
mod listener;
mod session;

pub use command::SmtpCommand;
pub use listener::{ConnectionPermit, SmtpServer};
pub use session::{SessionSettings, SessionState, SmtpSession};
