use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message as Frame, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::{bus::user_topic, parse_user_id, AppError, AppResult, AppState, Required};

use super::msg;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConnectQuery {
    user_id: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn connect(
    State(state): State<AppState>,
    Query(ConnectQuery { user_id }): Query<ConnectQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<Response> {
    let user_id = parse_user_id(&user_id.required("userId")?)?;
    let ws = ws.map_err(|rejection| {
        tracing::warn!(user_id, error = %rejection, "websocket upgrade rejected");
        AppError::Upgrade(rejection.body_text())
    })?;

    Ok(ws
        .on_failed_upgrade(move |err| {
            tracing::warn!(user_id, error = %err, "websocket upgrade failed");
        })
        .on_upgrade(move |socket| session(state, user_id, socket)))
}

/// One connected user: a forwarding task drains the user's topic onto the
/// socket while this task reads frames into ingestion until the peer goes away.
async fn session(state: AppState, user_id: i64, socket: WebSocket) {
    let mut subscription = state.bus.subscribe(&user_topic(user_id));
    let (sender, mut receiver) = socket.split();
    // the websocket sink takes one writer at a time
    let sender = Arc::new(Mutex::new(sender));

    state.metrics.connections_active.inc();
    tracing::info!(user_id, "session opened");

    let forward_sender = Arc::clone(&sender);
    let forward_task = tokio::spawn(async move {
        while let Some(payload) = subscription.next().await {
            let frame = Frame::Text((&*payload).into());
            if let Err(err) = forward_sender.lock().await.send(frame).await {
                tracing::debug!(user_id, error = %err, "forward write failed");
                break;
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                let err = AppError::Transport(err);
                tracing::debug!(user_id, error = %err, "websocket read failed");
                break;
            }
        };

        let raw: &[u8] = match &frame {
            Frame::Text(text) => text.as_str().as_bytes(),
            Frame::Binary(bytes) => &bytes[..],
            Frame::Close(_) => break,
            Frame::Ping(_) | Frame::Pong(_) => continue,
        };

        match msg::ingest(&state, raw).await {
            Ok(_) => {}
            Err(err) => tracing::error!(user_id, error = %err, "ingest failed"),
        }
    }

    // aborting drops the subscription, which unsubscribes the topic
    forward_task.abort();
    let _ = forward_task.await;
    if let Err(err) = sender.lock().await.close().await {
        tracing::debug!(user_id, error = %err, "close failed");
    }

    state.metrics.connections_active.dec();
    tracing::info!(user_id, "session closed");
}
