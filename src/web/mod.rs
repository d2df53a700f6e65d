//! HTTP API for mailsink.
//!
//! This module provides a JSON API over the message store and a WebSocket
//! stream of hub events.

pub mod dto;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod server;
pub mod ws;

pub use error::{ApiError, ErrorCode};
pub use handlers::AppState;
pub use router::create_router;
pub use server::WebServer;
