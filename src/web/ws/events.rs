//! Event stream WebSocket handler.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::hub::Subscription;
use crate::web::handlers::AppState;

/// Interval between keepalive pings.
pub const PING_PERIOD: Duration = Duration::from_secs(30);

/// WebSocket event stream handler.
///
/// GET /ws
pub async fn events_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let subscription = match state.hub.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::debug!("WebSocket rejected: {}", e);
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let id = subscription.id();
    tracing::debug!(subscriber = id, "WebSocket client connected");

    let (ws_sender, ws_receiver) = socket.split();
    stream_events(ws_sender, ws_receiver, subscription, PING_PERIOD).await;

    tracing::debug!(subscriber = id, "WebSocket client disconnected");
}

/// Forward hub events to the client until either side goes away.
///
/// A ping goes out every `ping_period`; a client that has sent nothing for
/// two periods is dropped.
async fn stream_events<Tx, Rx, E>(
    mut ws_sender: Tx,
    mut ws_receiver: Rx,
    mut subscription: Subscription,
    ping_period: Duration,
) where
    Tx: Sink<Message> + Unpin,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let pong_wait = ping_period * 2;
    let mut ping = interval_at(Instant::now() + ping_period, ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!("Failed to encode event: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                None => {
                    // Hub closed the queue: overflow or shutdown.
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            },

            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(data))) => {
                    last_seen = Instant::now();
                    if ws_sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {
                    last_seen = Instant::now();
                }
                Some(Err(e)) => {
                    tracing::debug!("WebSocket error: {}", e);
                    break;
                }
            },

            _ = ping.tick() => {
                if last_seen.elapsed() > pong_wait {
                    tracing::debug!(subscriber = subscription.id(), "WebSocket client timed out");
                    break;
                }
                if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}
