//! HTTP request handlers.

pub mod mail;
pub mod system;

pub use mail::{
    delete_all_emails, delete_email, get_attachment, get_email, get_email_html, get_email_raw,
    list_emails, mark_email_read, search_emails,
};
pub use system::{health, stats};

use crate::db::Database;
use crate::hub::HubHandle;

use super::error::ApiError;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Message store.
    pub db: Database,
    /// Event hub; deletions are announced here.
    pub hub: HubHandle,
}

impl AppState {
    /// Create a new application state.
    pub fn new(db: Database, hub: HubHandle) -> Self {
        Self { db, hub }
    }
}

/// Parse a positive numeric path segment.
pub(crate) fn parse_id(raw: &str) -> Result<i64, ApiError> {
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ApiError::invalid_id(raw)),
    }
}
