use crate::{
    config::ClientConfig,
    coordinator::SyncCoordinator,
    database::ClientDatabase,
    events::{EventDispatcher, SyncState},
    reactor::AccountReactor,
    remote::RemoteStoreClient,
    session::SessionAuthenticator,
    transport::RecordTransport,
    websocket::WebSocketTransport,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tasksync_core::{models::TaskItem, SyncResult};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// The sync engine as a whole: local store, session, remote client, coordinator and
/// account-change reactor wired together.
pub struct Client {
    db: Arc<ClientDatabase>,
    events: Arc<EventDispatcher>,
    session: Arc<SessionAuthenticator>,
    coordinator: SyncCoordinator,
    reactor: AccountReactor,
    reactor_task: JoinHandle<()>,
}

impl Client {
    /// Open the local store and talk to `config.server_url` over WebSocket.
    pub async fn new(config: ClientConfig) -> SyncResult<Self> {
        let events = Arc::new(EventDispatcher::new());
        let transport = Arc::new(WebSocketTransport::new(
            config.server_url.clone(),
            config.identity.clone(),
            config.api_key.clone(),
            config.api_secret.clone(),
            Some(events.clone()),
        ));
        Self::with_transport(config, transport, events).await
    }

    /// Open the local store and use `transport` as the record service.
    pub async fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn RecordTransport>,
        events: Arc<EventDispatcher>,
    ) -> SyncResult<Self> {
        let db = Arc::new(ClientDatabase::new(&config.database_url).await?);
        db.run_migrations().await?;

        let session =
            SessionAuthenticator::new(transport.clone(), db.clone(), events.clone(), &config)
                .await?;
        let remote = Arc::new(RemoteStoreClient::new(
            transport,
            session.clone(),
            config.request_timeout,
        ));
        let coordinator = SyncCoordinator::new(
            db.clone(),
            remote,
            events.clone(),
            config.worker_pool_size,
        );
        let reactor = AccountReactor::new(coordinator.clone(), session.clone());
        let reactor_task = reactor.spawn()?;

        tracing::info!(
            "CLIENT: Ready (database {}, {} workers)",
            config.database_url,
            config.worker_pool_size
        );

        Ok(Self {
            db,
            events,
            session,
            coordinator,
            reactor,
            reactor_task,
        })
    }

    pub async fn add(&self, item: TaskItem) -> SyncResult<TaskItem> {
        self.coordinator.add(item).await
    }

    pub async fn update(&self, item: TaskItem) -> SyncResult<TaskItem> {
        self.coordinator.update(item).await
    }

    pub async fn delete(&self, id: Uuid) -> SyncResult<()> {
        self.coordinator.delete(id).await
    }

    pub async fn fetch(&self) -> SyncResult<Vec<TaskItem>> {
        self.coordinator.fetch().await
    }

    pub async fn perform_sync(&self) -> SyncResult<usize> {
        self.coordinator.perform_sync().await
    }

    pub async fn count_pending(&self) -> SyncResult<usize> {
        self.coordinator.count_pending().await
    }

    pub async fn last_sync_time(&self) -> SyncResult<Option<DateTime<Utc>>> {
        self.coordinator.last_sync_time().await
    }

    /// Log out: end the remote session, then drop all local data.
    pub async fn sign_out(&self) -> SyncResult<()> {
        self.session.sign_out().await?;
        self.db.clear_all().await?;
        self.events.emit_sync_status(SyncState::Idle);
        self.events.emit_data_refreshed();
        Ok(())
    }

    pub async fn wait_for_background(&self) {
        self.coordinator.wait_for_background().await;
    }

    pub fn events(&self) -> Arc<EventDispatcher> {
        self.events.clone()
    }

    pub fn session(&self) -> &Arc<SessionAuthenticator> {
        &self.session
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn reactor(&self) -> &AccountReactor {
        &self.reactor
    }

    pub fn database(&self) -> &Arc<ClientDatabase> {
        &self.db
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reactor_task.abort();
    }
}
