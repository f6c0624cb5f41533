//! Reacts to account changes by resetting local state.
//!
//! Data of one identity must never be visible while another is active, so both an
//! account switch and a revoked session wipe the local store before anything else.

use crate::{
    coordinator::SyncCoordinator,
    events::{EventDispatcher, SyncEvent, SyncState},
    session::SessionAuthenticator,
};
use std::sync::Arc;
use tasksync_core::{models::TaskItem, SyncResult};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct AccountReactor {
    coordinator: SyncCoordinator,
    session: Arc<SessionAuthenticator>,
    events: Arc<EventDispatcher>,
}

impl AccountReactor {
    pub fn new(coordinator: SyncCoordinator, session: Arc<SessionAuthenticator>) -> Self {
        Self {
            events: coordinator.events().clone(),
            coordinator,
            session,
        }
    }

    /// Listen on the event bus. Runs until the returned handle is aborted.
    pub fn spawn(&self) -> SyncResult<JoinHandle<()>> {
        let mut rx = self.events.subscribe()?;
        let reactor = self.clone();

        Ok(tokio::spawn(async move {
            tracing::info!("REACTOR: Listening for account changes");
            while let Some(event) = rx.recv().await {
                let result = match event {
                    SyncEvent::AccountChanged { identity } => {
                        reactor.on_identity_changed(&identity).await.map(|_| ())
                    }
                    SyncEvent::RemoteUnavailable => {
                        reactor.on_remote_unavailable().await.map(|_| ())
                    }
                    _ => Ok(()),
                };
                if let Err(e) = result {
                    tracing::error!("REACTOR: Failed to reset local state: {}", e);
                }
            }
        }))
    }

    /// Wipe the previous identity's data, then reconcile the new identity's.
    ///
    /// Returns the reloaded (empty) task list that was announced.
    pub async fn on_identity_changed(&self, identity: &str) -> SyncResult<Vec<TaskItem>> {
        tracing::info!("REACTOR: Identity changed to {}, clearing local data", identity);

        let db = self.coordinator.database();
        db.clear_all().await?;
        db.set_current_identity(identity).await?;
        self.session.clear_failures();

        let items = db.get_all_tasks().await?;
        self.events.emit_sync_status(SyncState::Idle);
        self.events.emit_data_refreshed();

        let coordinator = self.coordinator.clone();
        let events = self.events.clone();
        self.coordinator.spawn_background(async move {
            match coordinator.pull_remote().await {
                Ok(0) => {}
                Ok(changes) => {
                    tracing::info!("REACTOR: Loaded {} tasks for the new identity", changes);
                    events.emit_data_refreshed();
                }
                Err(e) => tracing::warn!("REACTOR: Pull after account change failed: {}", e),
            }
        });

        Ok(items)
    }

    /// Wipe local data and reset the session. No reconciliation follows.
    pub async fn on_remote_unavailable(&self) -> SyncResult<Vec<TaskItem>> {
        tracing::warn!("REACTOR: Remote unavailable, clearing local data");

        let db = self.coordinator.database();
        db.clear_all().await?;

        let items = db.get_all_tasks().await?;
        self.events.emit_sync_status(SyncState::Idle);
        self.events.emit_data_refreshed();

        self.session.force_reset().await?;
        Ok(items)
    }
}
