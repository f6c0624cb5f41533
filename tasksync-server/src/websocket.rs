use crate::{
    record_handler::{error_reply, RecordHandler},
    AppState,
};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tasksync_core::protocol::{ClientMessage, ErrorCode, ServerMessage};
use tokio::sync::mpsc;
use uuid::Uuid;

pub async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(100);

    // Forward outbound messages to the socket
    tokio::spawn(async move {
        tracing::debug!("SERVER: Sender task started for connection {}", connection_id);
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("SERVER: Failed to encode message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                tracing::warn!(
                    "SERVER: Failed to send WebSocket message to connection {}",
                    connection_id
                );
                break;
            }
        }
        tracing::debug!("SERVER: Sender task terminated for connection {}", connection_id);
    });

    let mut session: Option<(Uuid, RecordHandler)> = None;

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("SERVER: Connection {} errored: {}", connection_id, e);
                break;
            }
        };

        let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!("SERVER: Failed to parse client message: {}", e);
                let _ = tx
                    .send(error_reply(
                        None,
                        ErrorCode::InvalidMessage,
                        format!("Invalid JSON: {}", e),
                    ))
                    .await;
                continue;
            }
        };

        match client_msg {
            ClientMessage::Authenticate {
                identity,
                api_key,
                signature,
                timestamp,
            } => {
                let verified = match state
                    .auth
                    .verify_hmac(&api_key, &signature, timestamp, &identity, "")
                    .await
                {
                    Ok(valid) => valid,
                    Err(e) => {
                        tracing::error!("SERVER: HMAC verification database error: {}", e);
                        let _ = tx
                            .send(ServerMessage::AuthError {
                                reason: "Authentication service temporarily unavailable"
                                    .to_string(),
                            })
                            .await;
                        break;
                    }
                };

                if !verified {
                    let _ = tx
                        .send(ServerMessage::AuthError {
                            reason: "Invalid credentials".to_string(),
                        })
                        .await;
                    break;
                }

                if let Some((previous, _)) = session.take() {
                    state.sessions.remove(&previous);
                }
                let session_id = state.sessions.register(&identity, tx.clone());
                session = Some((
                    session_id,
                    RecordHandler::new(
                        state.db.clone(),
                        tx.clone(),
                        identity.clone(),
                        state.record_quota,
                    ),
                ));

                let _ = tx
                    .send(ServerMessage::AuthSuccess {
                        session_id,
                        identity,
                    })
                    .await;
            }
            ClientMessage::Ping => {
                let _ = tx.send(ServerMessage::Pong).await;
            }
            request => {
                let active = session
                    .as_ref()
                    .is_some_and(|(session_id, _)| state.sessions.is_active(session_id));
                if !active {
                    // Never authenticated, or revoked since.
                    session = None;
                    let _ = tx
                        .send(error_reply(
                            request.request_id(),
                            ErrorCode::AuthExpired,
                            "Not authenticated",
                        ))
                        .await;
                    continue;
                }

                if let Some((_, handler)) = &session {
                    if let Err(e) = handler.handle_message(request).await {
                        tracing::warn!(
                            "SERVER: Dropping connection {} of {}: {}",
                            connection_id,
                            handler.identity(),
                            e
                        );
                        break;
                    }
                }
            }
        }
    }

    if let Some((session_id, _)) = session {
        state.sessions.remove(&session_id);
    }
    tracing::debug!("SERVER: Connection {} closed", connection_id);
}
