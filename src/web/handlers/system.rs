//! Stats and health handlers.

use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::Utc;

use super::AppState;
use crate::mail::{MessageRepository, MessageStats};
use crate::web::dto::{ApiResponse, HealthResponse};
use crate::web::error::ApiError;

/// Mailbox counters.
///
/// GET /api/stats
pub async fn stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<MessageStats>>, ApiError> {
    let stats = MessageRepository::new(&state.db).stats(Utc::now()).await?;
    Ok(Json(ApiResponse::new(stats)))
}

/// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<ApiResponse<HealthResponse>> {
    let status = if state.db.is_closed() {
        "shutting_down"
    } else {
        "healthy"
    };
    Json(ApiResponse::new(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
    }))
}
