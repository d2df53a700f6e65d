//! WebSocket event stream.
//!
//! Each connection subscribes to the hub and receives every lifecycle
//! event as a JSON text frame.

pub mod events;

pub use events::events_ws_handler;
