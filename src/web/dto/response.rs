//! Response DTOs for the HTTP API.

use serde::Serialize;

use crate::mail::{Message, MessagePage, Page};

/// Success envelope: `{"success": true, "data": ...}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    /// Always `true`.
    pub success: bool,
    /// Response data.
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    /// Create a new API response.
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// One page of a listing or search.
#[derive(Debug, Serialize)]
pub struct MessageListResponse {
    /// Messages on this page.
    pub emails: Vec<Message>,
    /// Matches ignoring pagination.
    pub total: i64,
    /// Effective page size.
    pub limit: i64,
    /// Effective offset.
    pub offset: i64,
}

impl MessageListResponse {
    /// Combine a result page with the window that produced it.
    pub fn new(result: MessagePage, page: Page) -> Self {
        Self {
            emails: result.messages,
            total: result.total,
            limit: page.limit(),
            offset: page.offset(),
        }
    }
}

/// Single delete result.
#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    /// Removed message ID.
    pub deleted: i64,
}

/// Bulk delete result.
#[derive(Debug, Serialize)]
pub struct ClearedResponse {
    /// Human-readable summary.
    pub message: String,
    /// Number of messages removed.
    pub deleted: u64,
}

/// Read flag update result.
#[derive(Debug, Serialize)]
pub struct ReadResponse {
    /// Message ID.
    pub id: i64,
    /// New read flag.
    pub read: bool,
}

/// Health check result.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `healthy` while the store accepts writes, `shutting_down` afterwards.
    pub status: &'static str,
    /// Crate version.
    pub version: &'static str,
}
