pub mod auth;
pub mod database;
pub mod queries;
pub mod record_handler;
pub mod websocket;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Router,
};
use dashmap::DashMap;
use std::sync::Arc;
use tasksync_core::protocol::ServerMessage;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

#[derive(Clone)]
pub struct SessionEntry {
    pub identity: String,
    pub tx: mpsc::Sender<ServerMessage>,
}

/// Live authenticated sessions: session_id -> identity and outbound channel.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, identity: &str, tx: mpsc::Sender<ServerMessage>) -> Uuid {
        let session_id = Uuid::new_v4();
        self.sessions.insert(
            session_id,
            SessionEntry {
                identity: identity.to_string(),
                tx,
            },
        );
        tracing::info!(
            "SERVER: Session {} opened for {} ({} for this identity)",
            session_id,
            identity,
            self.sessions_for(identity)
        );
        session_id
    }

    pub fn remove(&self, session_id: &Uuid) {
        if let Some((_, entry)) = self.sessions.remove(session_id) {
            tracing::debug!("SERVER: Session {} of {} closed", session_id, entry.identity);
        }
    }

    pub fn is_active(&self, session_id: &Uuid) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn sessions_for(&self, identity: &str) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.identity == identity)
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// End every session of `identity` and tell its clients why.
    ///
    /// Further requests on those connections are answered with `AuthExpired`.
    /// Returns the number of sessions revoked.
    pub async fn revoke_identity(&self, identity: &str, reason: &str) -> usize {
        let revoked: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| entry.identity == identity)
            .map(|entry| *entry.key())
            .collect();

        let mut count = 0;
        for session_id in revoked {
            // Release the map entry before awaiting on the channel.
            let Some((_, entry)) = self.sessions.remove(&session_id) else {
                continue;
            };
            count += 1;
            let _ = entry
                .tx
                .send(ServerMessage::SessionRevoked {
                    reason: reason.to_string(),
                })
                .await;
        }

        tracing::warn!("SERVER: Revoked {} sessions of {}: {}", count, identity, reason);
        count
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<database::ServerDatabase>,
    pub auth: auth::AuthState,
    pub sessions: SessionRegistry,
    /// Maximum records per identity; `None` is unlimited.
    pub record_quota: Option<i64>,
}

impl AppState {
    pub fn new(db: Arc<database::ServerDatabase>, record_quota: Option<i64>) -> Self {
        Self {
            auth: auth::AuthState::new(db.clone()),
            db,
            sessions: SessionRegistry::new(),
            record_quota,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(|| async { "OK" }))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| websocket::handle_websocket(socket, state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_revoke_identity_notifies_only_its_sessions() {
        let registry = SessionRegistry::new();
        let (tx_x1, mut rx_x1) = mpsc::channel(4);
        let (tx_x2, mut rx_x2) = mpsc::channel(4);
        let (tx_y, mut rx_y) = mpsc::channel(4);

        let x1 = registry.register("user-x", tx_x1);
        let x2 = registry.register("user-x", tx_x2);
        let y = registry.register("user-y", tx_y);
        assert_eq!(registry.sessions_for("user-x"), 2);

        assert_eq!(registry.revoke_identity("user-x", "signed out").await, 2);

        assert!(!registry.is_active(&x1));
        assert!(!registry.is_active(&x2));
        assert!(registry.is_active(&y));
        assert_eq!(registry.len(), 1);

        for rx in [&mut rx_x1, &mut rx_x2] {
            match rx.recv().await {
                Some(ServerMessage::SessionRevoked { reason }) => assert_eq!(reason, "signed out"),
                other => panic!("expected SessionRevoked, got {:?}", other),
            }
        }
        assert!(rx_y.try_recv().is_err());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let id = registry.register("user-x", tx);

        registry.remove(&id);
        registry.remove(&id);
        assert!(registry.is_empty());
    }
}
