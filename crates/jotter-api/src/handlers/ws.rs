//! WebSocket transport for the notification hub.
//!
//! Clients connect to `/api/v1/ws` with a bearer credential (header or
//! `?token=`) and are joined to `user:{login}`. Further topics are managed
//! with control frames of the same shape as server events:
//!
//! ```text
//! {"event":"subscribe:queue","data":{"spaceId":"..."}}
//! {"event":"unsubscribe:queue","data":{"spaceId":"..."}}
//! {"event":"subscribe:request","data":{"requestId":"..."}}
//! {"event":"unsubscribe:request","data":{"requestId":"..."}}
//! ```
//!
//! Each control frame is acknowledged with `subscribed`/`unsubscribed`;
//! malformed frames get an `error` frame and the socket stays open.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;
use uuid::Uuid;

use jotter_core::defaults;
use jotter_core::{ConnectionId, Topic};

use crate::auth::AuthUser;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpaceRef {
    space_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestRef {
    request_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
enum ControlMessage {
    #[serde(rename = "subscribe:queue")]
    SubscribeQueue(SpaceRef),
    #[serde(rename = "unsubscribe:queue")]
    UnsubscribeQueue(SpaceRef),
    #[serde(rename = "subscribe:request")]
    SubscribeRequest(RequestRef),
    #[serde(rename = "unsubscribe:request")]
    UnsubscribeRequest(RequestRef),
}

fn error_frame(message: impl Into<String>) -> JsonValue {
    json!({"event": "error", "data": {"message": message.into()}})
}

fn ack_frame(event: &str, topic: &Topic) -> JsonValue {
    json!({"event": event, "data": {"topic": topic.to_string()}})
}

/// GET /api/v1/ws
pub async fn ws_handler(
    auth: AuthUser,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, auth))
}

async fn handle_ws_connection(socket: WebSocket, state: AppState, auth: AuthUser) {
    let (conn, mut event_rx) = state.hub.connect(&auth.login).await;
    let count = state.ws_connections.fetch_add(1, Ordering::Relaxed) + 1;
    tracing::info!(
        active = count,
        connection_id = %conn,
        login = %auth.login,
        "WebSocket connection opened"
    );

    let (mut sender, mut receiver) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<JsonValue>(16);

    // Forward hub events and control replies to the client
    let mut send_task = tokio::spawn(async move {
        let mut ping_interval =
            tokio::time::interval(Duration::from_secs(defaults::WS_PING_INTERVAL_SECS));
        loop {
            let frame = tokio::select! {
                event = event_rx.recv() => match event {
                    Some(evt) => match serde_json::to_string(&evt) {
                        Ok(json) => Message::Text(json),
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to encode hub event");
                            continue;
                        }
                    },
                    // Hub dropped the connection
                    None => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(value) => Message::Text(value.to_string()),
                    None => break,
                },
                _ = ping_interval.tick() => Message::Ping(Vec::new()),
            };
            if sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    // Handle control messages from the client
    let recv_state = state.clone();
    let user_id = auth.user_id;
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = handle_control(&recv_state, conn, user_id, &text).await;
                    if reply_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.disconnect(conn).await;
    let count = state.ws_connections.fetch_sub(1, Ordering::Relaxed) - 1;
    tracing::info!(active = count, connection_id = %conn, "WebSocket connection closed");
}

async fn handle_control(
    state: &AppState,
    conn: ConnectionId,
    user_id: Uuid,
    text: &str,
) -> JsonValue {
    let message: ControlMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(connection_id = %conn, error = %e, "Malformed control message");
            return error_frame(format!("malformed message: {e}"));
        }
    };

    match message {
        ControlMessage::SubscribeQueue(r) => {
            let topic = Topic::Queue(r.space_id);
            state.hub.join(conn, topic.clone()).await;
            ack_frame("subscribed", &topic)
        }
        ControlMessage::UnsubscribeQueue(r) => {
            let topic = Topic::Queue(r.space_id);
            state.hub.leave(conn, &topic).await;
            ack_frame("unsubscribed", &topic)
        }
        ControlMessage::SubscribeRequest(r) => match state.lifecycle.get(r.request_id).await {
            Ok(request) if request.user_id == user_id => {
                let topic = Topic::Request(r.request_id);
                state.hub.join(conn, topic.clone()).await;
                ack_frame("subscribed", &topic)
            }
            Ok(_) => error_frame("request belongs to another user"),
            Err(e) => error_frame(e.to_string()),
        },
        ControlMessage::UnsubscribeRequest(r) => {
            let topic = Topic::Request(r.request_id);
            state.hub.leave(conn, &topic).await;
            ack_frame("unsubscribed", &topic)
        }
    }
}
