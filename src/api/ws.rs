//! Live event WebSocket: one connection per viewer, subscribed to the
//! broadcaster for the lifetime of the socket.
//!
//! Grounded on `backend/src/api/ws/chat/mod.rs`'s upgrade handler
//! (`WebSocketUpgrade` → `on_upgrade(move |socket| handle_socket(...))`,
//! split sender/receiver) simplified to this system's one-way push: no
//! client message routing is needed, so the receiver half is only used to
//! detect disconnects.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, info};

use crate::broadcast::LiveEvent;
use crate::state::AppState;

pub async fn live_events_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let subscription = state.broadcaster.subscribe();

    let snapshot = state.metrics.quick_summary(None, None).await;
    let initial = LiveEvent::InitialLoad {
        snapshot: serde_json::to_value(snapshot).unwrap_or(json!({})),
    };
    if send_event(&mut sender, &initial).await.is_err() {
        return;
    }

    info!("live event subscriber connected");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    None | Some(Err(_)) => break,
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {} // this channel is push-only; anything else is ignored
                }
            }
        }
    }

    subscription.unsubscribe();
    debug!("live event subscriber disconnected");
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &LiveEvent,
) -> Result<(), axum::Error> {
    let Ok(text) = serde_json::to_string(event) else {
        return Ok(());
    };
    sender.send(Message::Text(text.into())).await
}
