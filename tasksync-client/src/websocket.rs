//! WebSocket transport to `tasksync-server`.
//!
//! One connection carries every request. Responses are matched to requests by
//! `request_id`, so pushes from the worker pool can be in flight together.

use crate::{
    events::EventDispatcher,
    transport::{RecordTransport, RemoteResult},
};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tasksync_core::{
    errors::RemoteError,
    models::TodoRecord,
    protocol::{ClientMessage, ServerMessage},
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const PING_INTERVAL: Duration = Duration::from_secs(30);

type Waiters = Arc<StdMutex<HashMap<Uuid, oneshot::Sender<ServerMessage>>>>;
type AuthWaiter = Arc<StdMutex<Option<oneshot::Sender<ServerMessage>>>>;

struct Connection {
    tx: mpsc::Sender<ClientMessage>,
    alive: Arc<AtomicBool>,
    authenticated: Arc<AtomicBool>,
}

impl Connection {
    fn is_usable(&self) -> bool {
        self.alive.load(Ordering::Relaxed) && self.authenticated.load(Ordering::Relaxed)
    }
}

pub struct WebSocketTransport {
    server_url: String,
    identity: String,
    api_key: String,
    api_secret: String,
    events: Option<Arc<EventDispatcher>>,
    connection: Mutex<Option<Connection>>,
    pending: Waiters,
    auth_waiter: AuthWaiter,
}

impl WebSocketTransport {
    pub fn new(
        server_url: impl Into<String>,
        identity: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        events: Option<Arc<EventDispatcher>>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            identity: identity.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            events,
            connection: Mutex::new(None),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            auth_waiter: Arc::new(StdMutex::new(None)),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(Connection::is_usable)
    }

    pub fn create_hmac_signature(
        secret: &str,
        timestamp: i64,
        identity: &str,
        api_key: &str,
        body: &str,
    ) -> RemoteResult<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| RemoteError::Unknown(format!("invalid API secret: {}", e)))?;

        let message = format!("{}.{}.{}.{}", timestamp, identity, api_key, body);
        mac.update(message.as_bytes());

        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn connect(&self) -> RemoteResult<Connection> {
        let server_url = self.server_url.clone();
        let (ws_stream, _) = (|| async { connect_async(server_url.as_str()).await })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(100))
                    .with_max_delay(Duration::from_secs(2))
                    .with_max_times(3),
            )
            .notify(|err, delay| {
                tracing::debug!(
                    "REMOTE: Connection to {} failed ({}), retrying in {:?}",
                    server_url,
                    err,
                    delay
                );
            })
            .await
            .map_err(|e| RemoteError::NetworkUnavailable(e.to_string()))?;

        tracing::info!("REMOTE: Connected to {}", self.server_url);

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<ClientMessage>(100);
        let alive = Arc::new(AtomicBool::new(true));
        let authenticated = Arc::new(AtomicBool::new(false));

        // Writer
        let writer_alive = alive.clone();
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(PING_INTERVAL);
            heartbeat.tick().await;
            loop {
                let msg = tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = heartbeat.tick() => ClientMessage::Ping,
                };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("REMOTE: Failed to encode message: {}", e);
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    writer_alive.store(false, Ordering::Relaxed);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Reader
        let reader_alive = alive.clone();
        let reader_authenticated = authenticated.clone();
        let pending = self.pending.clone();
        let auth_waiter = self.auth_waiter.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let msg = match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!("REMOTE: Ignoring malformed server message: {}", e);
                        continue;
                    }
                };

                match msg {
                    ServerMessage::AuthSuccess { .. } | ServerMessage::AuthError { .. } => {
                        if matches!(msg, ServerMessage::AuthSuccess { .. }) {
                            reader_authenticated.store(true, Ordering::Relaxed);
                        }
                        if let Some(waiter) = lock(&auth_waiter).take() {
                            let _ = waiter.send(msg);
                        }
                    }
                    ServerMessage::SessionRevoked { reason } => {
                        tracing::warn!("REMOTE: Session revoked by server: {}", reason);
                        reader_authenticated.store(false, Ordering::Relaxed);
                        if let Some(events) = &events {
                            events.emit_remote_unavailable();
                        }
                    }
                    ServerMessage::Pong => {
                        tracing::trace!("REMOTE: Pong");
                    }
                    other => match other.request_id() {
                        Some(request_id) => {
                            if let Some(waiter) = lock(&pending).remove(&request_id) {
                                let _ = waiter.send(other);
                            }
                        }
                        None => {
                            // Errors outside a request answer the authentication attempt.
                            if let Some(waiter) = lock(&auth_waiter).take() {
                                let _ = waiter.send(other);
                            } else {
                                tracing::warn!("REMOTE: Unsolicited server message: {:?}", other);
                            }
                        }
                    },
                }
            }

            tracing::warn!("REMOTE: Connection closed");
            reader_alive.store(false, Ordering::Relaxed);
            reader_authenticated.store(false, Ordering::Relaxed);
            // Dropping the senders fails every outstanding request.
            lock(&pending).clear();
            lock(&auth_waiter).take();
        });

        Ok(Connection {
            tx,
            alive,
            authenticated,
        })
    }

    async fn request(&self, message: ClientMessage) -> RemoteResult<ServerMessage> {
        let request_id = message
            .request_id()
            .ok_or_else(|| RemoteError::Unknown("message carries no request id".to_string()))?;

        let tx = {
            let connection = self.connection.lock().await;
            match connection.as_ref() {
                Some(connection) if connection.is_usable() => connection.tx.clone(),
                // No live session: let the caller re-authenticate.
                _ => return Err(RemoteError::AuthExpired),
            }
        };

        let (waiter, response) = oneshot::channel();
        lock(&self.pending).insert(request_id, waiter);

        if tx.send(message).await.is_err() {
            lock(&self.pending).remove(&request_id);
            return Err(RemoteError::NetworkUnavailable(
                "connection closed".to_string(),
            ));
        }

        response
            .await
            .map_err(|_| RemoteError::NetworkUnavailable("connection lost".to_string()))
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn unexpected(response: ServerMessage, record: Option<Uuid>) -> RemoteError {
    match response {
        ServerMessage::Error { code, message, .. } => {
            RemoteError::from_error_code(code, message, record)
        }
        other => RemoteError::Unknown(format!("unexpected response: {:?}", other)),
    }
}

#[async_trait]
impl RecordTransport for WebSocketTransport {
    async fn authenticate(&self) -> RemoteResult<String> {
        let mut connection = self.connection.lock().await;

        let needs_connect = !connection
            .as_ref()
            .is_some_and(|c| c.alive.load(Ordering::Relaxed));
        if needs_connect {
            *connection = Some(self.connect().await?);
        }
        let Some(current) = connection.as_ref() else {
            return Err(RemoteError::NetworkUnavailable("not connected".to_string()));
        };
        current.authenticated.store(false, Ordering::Relaxed);

        let timestamp = chrono::Utc::now().timestamp();
        let signature = Self::create_hmac_signature(
            &self.api_secret,
            timestamp,
            &self.identity,
            &self.api_key,
            "",
        )?;

        let (waiter, response) = oneshot::channel();
        *lock(&self.auth_waiter) = Some(waiter);

        current
            .tx
            .send(ClientMessage::Authenticate {
                identity: self.identity.clone(),
                api_key: self.api_key.clone(),
                signature,
                timestamp,
            })
            .await
            .map_err(|_| RemoteError::NetworkUnavailable("connection closed".to_string()))?;

        match response.await {
            Ok(ServerMessage::AuthSuccess {
                identity,
                session_id,
            }) => {
                tracing::info!("REMOTE: Session {} established for {}", session_id, identity);
                Ok(identity)
            }
            Ok(ServerMessage::AuthError { reason }) => {
                Err(RemoteError::Unknown(format!("authentication rejected: {}", reason)))
            }
            Ok(other) => Err(unexpected(other, None)),
            Err(_) => Err(RemoteError::NetworkUnavailable(
                "connection lost during authentication".to_string(),
            )),
        }
    }

    async fn fetch_record(&self, id: Uuid) -> RemoteResult<Option<TodoRecord>> {
        let response = self
            .request(ClientMessage::FetchRecord {
                request_id: Uuid::new_v4(),
                id,
            })
            .await?;

        match response {
            ServerMessage::Record { record, .. } => Ok(record),
            other => Err(unexpected(other, Some(id))),
        }
    }

    async fn save_record(
        &self,
        record: TodoRecord,
        expected_change_tag: Option<String>,
    ) -> RemoteResult<TodoRecord> {
        let id = record.id;
        let response = self
            .request(ClientMessage::SaveRecord {
                request_id: Uuid::new_v4(),
                record,
                expected_change_tag,
            })
            .await?;

        match response {
            ServerMessage::Record {
                record: Some(saved),
                ..
            } => Ok(saved),
            other => Err(unexpected(other, Some(id))),
        }
    }

    async fn query_records(&self, owner_identity: &str) -> RemoteResult<Vec<TodoRecord>> {
        let response = self
            .request(ClientMessage::QueryRecords {
                request_id: Uuid::new_v4(),
                owner_identity: owner_identity.to_string(),
            })
            .await?;

        match response {
            ServerMessage::Records { records, .. } => Ok(records),
            other => Err(unexpected(other, None)),
        }
    }

    async fn delete_record(&self, id: Uuid) -> RemoteResult<bool> {
        let response = self
            .request(ClientMessage::DeleteRecord {
                request_id: Uuid::new_v4(),
                id,
            })
            .await?;

        match response {
            ServerMessage::Deleted { existed, .. } => Ok(existed),
            other => Err(unexpected(other, Some(id))),
        }
    }
}
