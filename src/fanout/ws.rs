//! Push-stream transport — one WebSocket per subscriber.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use tracing::{debug, info, warn};

use super::model::{ClientMessage, ServerMessage, SubscriptionFilter};
use super::registry::StatusHub;

/// Serve one push-stream connection until the client leaves.
///
/// The connection starts with an empty filter and receives nothing until the
/// client sends `subscribe`.
pub async fn serve_socket(mut socket: WebSocket, hub: Arc<StatusHub>) {
    let (connection_id, mut updates) = hub.subscribe(SubscriptionFilter::default()).await;
    info!(%connection_id, "Status stream client connected");

    if !send(&mut socket, &ServerMessage::Connected { connection_id }).await {
        hub.unsubscribe(connection_id).await;
        return;
    }

    let mut keepalive = tokio::time::interval(hub.config().keepalive_interval);
    keepalive.tick().await;

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else {
                    debug!(%connection_id, "Subscriber channel closed");
                    break;
                };
                if !send(&mut socket, &ServerMessage::StatusUpdate(update)).await {
                    debug!(%connection_id, "Status stream client disconnected during send");
                    break;
                }
            }

            _ = keepalive.tick() => {
                if !send(&mut socket, &ServerMessage::Ping { timestamp: Utc::now() }).await {
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_client_message(&mut socket, &hub, connection_id, &text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(%connection_id, "Status stream client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(%connection_id, error = %e, "Status stream error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    hub.unsubscribe(connection_id).await;
    info!(%connection_id, "Status stream connection closed");
}

/// Apply one control message. Returns false once the socket is gone.
async fn handle_client_message(
    socket: &mut WebSocket,
    hub: &StatusHub,
    connection_id: uuid::Uuid,
    text: &str,
) -> bool {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(%connection_id, error = %e, "Invalid status stream message");
            return send(
                socket,
                &ServerMessage::Error {
                    message: format!("invalid message: {e}"),
                },
            )
            .await;
        }
    };

    match msg {
        ClientMessage::Subscribe { filter } => {
            debug!(
                %connection_id,
                task_ids = filter.task_ids.len(),
                kb_ids = filter.partition_ids.len(),
                task_types = filter.task_types.len(),
                "Filter updated"
            );
            hub.update_filter(connection_id, filter.clone()).await;
            let snapshot = match hub.snapshot(&filter).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(%connection_id, error = %e, "Failed to load subscription snapshot");
                    Vec::new()
                }
            };
            if !send(socket, &ServerMessage::Subscribed { filter }).await {
                return false;
            }
            for update in snapshot {
                if !send(socket, &ServerMessage::StatusUpdate(update)).await {
                    return false;
                }
            }
            true
        }
        ClientMessage::Unsubscribe => {
            hub.update_filter(connection_id, SubscriptionFilter::default())
                .await;
            send(socket, &ServerMessage::Unsubscribed).await
        }
        ClientMessage::Ping => send(socket, &ServerMessage::Pong).await,
    }
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize status stream message");
            true
        }
    }
}
