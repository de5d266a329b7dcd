//! Live status WebSocket endpoints.
//!
//! GET /ws/status       report channel, one shared topic filtered per session
//! GET /ws/scan-status  scan channel, one topic per url
//!
//! Clients send `{"url": ...}`; the protocol itself lives in
//! [`SubscriptionSession`]. This module only moves frames.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::server::app::AppState;
use crate::status::{Channel, SessionReply, SubscriptionSession};

pub async fn report_status_ws(
    ws: WebSocketUpgrade,
    Extension(state): Extension<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state, Channel::Report))
}

pub async fn scan_status_ws(
    ws: WebSocketUpgrade,
    Extension(state): Extension<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state, Channel::Scan))
}

async fn run_session(socket: WebSocket, state: AppState, channel: Channel) {
    let (mut sender, mut receiver) = socket.split();
    let mut session = SubscriptionSession::new(channel);
    let mut updates: Option<broadcast::Receiver<Value>> = None;

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(error = %e, "status socket read failed");
                        break;
                    }
                };

                let reply = match session.handle(&text) {
                    SessionReply::Joined { url, topic } => {
                        updates = Some(state.stream_hub.subscribe(&topic).await);
                        snapshot_message(&state, channel, &url).await
                    }
                    SessionReply::Refresh { url } => snapshot_message(&state, channel, &url).await,
                    SessionReply::Error(message) => SubscriptionSession::error_message(message),
                };
                if send_json(&mut sender, &reply).await.is_err() {
                    break;
                }
            }
            update = next_update(&mut updates) => match update {
                Ok(payload) => {
                    if session.accepts(&payload) && send_json(&mut sender, &payload).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        url = session.joined_url().unwrap_or_default(),
                        skipped,
                        "status subscriber lagged"
                    );
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    drop(updates);
    state.stream_hub.cleanup().await;

    debug!(
        url = session.joined_url().unwrap_or_default(),
        channel = channel.message_type(),
        "status session closed"
    );
}

async fn snapshot_message(state: &AppState, channel: Channel, url: &str) -> Value {
    state
        .status_reader
        .current(url)
        .await
        .to_message(channel.message_type())
}

/// Pending forever until the session has joined a topic.
async fn next_update(updates: &mut Option<broadcast::Receiver<Value>>) -> Result<Value, RecvError> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    value: &Value,
) -> Result<(), axum::Error> {
    sender.send(Message::Text(value.to_string())).await
}
