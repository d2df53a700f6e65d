//! Router configuration for the HTTP API.

use axum::{
    middleware,
    routing::{get, put},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use super::handlers::{
    delete_all_emails, delete_email, get_attachment, get_email, get_email_html, get_email_raw,
    health, list_emails, mark_email_read, search_emails, stats, AppState,
};
use super::middleware::{create_cors_layer, security_headers};
use super::ws::events_ws_handler;

/// Create the main router: the JSON API under `/api` plus `/ws`.
pub fn create_router(app_state: Arc<AppState>, cors_origins: &[String]) -> Router {
    let email_routes = Router::new()
        .route("/", get(list_emails).delete(delete_all_emails))
        .route("/search", get(search_emails))
        .route("/:id", get(get_email).delete(delete_email))
        .route("/:id/read", put(mark_email_read))
        .route("/:id/raw", get(get_email_raw))
        .route("/:id/html", get(get_email_html))
        .route("/:id/attachments/:aid", get(get_attachment));

    let api_routes = Router::new()
        .nest("/emails", email_routes)
        .route("/stats", get(stats))
        .route("/health", get(health));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(events_ws_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(create_cors_layer(cors_origins))
                .layer(middleware::from_fn(security_headers)),
        )
        .with_state(app_state)
}
