//! Request DTOs for the HTTP API.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::mail::{MessageFilter, Page, DEFAULT_PAGE_LIMIT};
use crate::web::error::ApiError;

/// Pagination parameters.
///
/// Values that do not parse as integers fall back to the defaults.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    /// Page size (clamped to 1..=100).
    #[serde(default)]
    pub limit: Option<String>,
    /// Number of messages to skip.
    #[serde(default)]
    pub offset: Option<String>,
}

impl PageQuery {
    /// Build the pagination window.
    pub fn page(&self) -> Result<Page, ApiError> {
        let limit = parse_or(self.limit.as_deref(), DEFAULT_PAGE_LIMIT);
        let offset = parse_or(self.offset.as_deref(), 0);
        Ok(Page::new(limit, offset)?)
    }
}

/// Query string for `GET /api/emails`.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Pagination.
    #[serde(flatten)]
    pub page: PageQuery,
    /// Sender substring.
    #[serde(default)]
    pub from: Option<String>,
    /// Recipient substring.
    #[serde(default)]
    pub to: Option<String>,
    /// Subject substring.
    #[serde(default)]
    pub subject: Option<String>,
    /// RFC 3339 lower bound on the receive time.
    #[serde(default)]
    pub since: Option<String>,
    /// RFC 3339 upper bound on the receive time.
    #[serde(default)]
    pub until: Option<String>,
}

impl ListQuery {
    /// Build the listing filter. Empty text parameters are ignored.
    pub fn filter(&self) -> Result<MessageFilter, ApiError> {
        let mut filter = MessageFilter::new();
        if let Some(from) = non_empty(&self.from) {
            filter = filter.sender(from);
        }
        if let Some(to) = non_empty(&self.to) {
            filter = filter.recipient(to);
        }
        if let Some(subject) = non_empty(&self.subject) {
            filter = filter.subject(subject);
        }
        if let Some(since) = non_empty(&self.since) {
            filter = filter.received_after(parse_timestamp("since", since)?);
        }
        if let Some(until) = non_empty(&self.until) {
            filter = filter.received_before(parse_timestamp("until", until)?);
        }
        Ok(filter)
    }
}

/// Query string for `GET /api/emails/search`.
#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    /// Search text.
    #[serde(default)]
    pub q: Option<String>,
    /// Pagination.
    #[serde(flatten)]
    pub page: PageQuery,
}

/// Body for `PUT /api/emails/:id/read`.
#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    /// New read flag.
    #[serde(default = "default_read")]
    pub read: bool,
}

fn default_read() -> bool {
    true
}

impl Default for MarkReadRequest {
    fn default() -> Self {
        Self {
            read: default_read(),
        }
    }
}

fn parse_or(raw: Option<&str>, default: i64) -> i64 {
    raw.and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_timestamp(name: &str, raw: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| ApiError::invalid_request(format!("{name} must be an RFC 3339 timestamp")))
}
