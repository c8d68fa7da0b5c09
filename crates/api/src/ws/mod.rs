//! Bus subscriptions over WebSocket.
//!
//! `GET /api/v1/ws?category=task&key=42` upgrades and streams every
//! matching bus message as a JSON text frame until either side closes.
//! Without `key` the whole category is streamed.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use fleet_events::{Category, Subscription, Topic};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    pub category: String,
    pub key: Option<String>,
}

/// Parse the subscription target from query parameters.
pub fn topic_from_query(query: &SubscribeQuery) -> AppResult<Topic> {
    let category: Category = query
        .category
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Unknown category '{}'", query.category)))?;
    Ok(match query.key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => Topic::key(category, key),
        _ => Topic::category(category),
    })
}

/// Upgrade to WebSocket and stream the requested topic.
///
/// The subscription is opened before the upgrade so an unknown category
/// or an unavailable bus is reported as a plain HTTP error.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<SubscribeQuery>,
) -> AppResult<impl IntoResponse> {
    let topic = topic_from_query(&query)?;
    let cancel = CancellationToken::new();
    let subscription = state
        .scheduler
        .bus()
        .subscribe(topic, cancel.clone())
        .await
        .map_err(|e| AppError::InternalError(format!("Bus subscription failed: {e}")))?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, subscription, cancel)))
}

async fn handle_socket(socket: WebSocket, mut subscription: Subscription, cancel: CancellationToken) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, topic = ?subscription.topic(), "WebSocket subscribed");

    let (mut sink, mut stream) = socket.split();

    // Sender task: forward bus messages to the WebSocket sink.
    let sender_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(message) = subscription.next().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(conn_id = %sender_conn_id, error = %e, "Unserializable bus message");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
        }
    });

    // Receiver loop: only close and errors matter.
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    cancel.cancel();
    send_task.abort();
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}
