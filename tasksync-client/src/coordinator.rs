//! Local-first orchestration.
//!
//! Every mutation lands in the local store and returns before the network is touched;
//! the remote leg runs on a bounded pool of background workers.

use crate::{
    database::ClientDatabase,
    events::{EventDispatcher, SyncState},
    remote::{RemoteOutcome, RemoteStoreClient},
    session::SessionAuthenticator,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tasksync_core::{
    errors::RemoteError,
    models::{now, TaskItem, TaskStatus},
    SyncError, SyncResult,
};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

/// What happened to one item's push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushResult {
    Synced,
    /// Remote unavailable or the item belongs to another identity; nothing was sent.
    Skipped,
    /// Pushed, but the local copy changed meanwhile and stays unsynced.
    Superseded,
    /// Deleted locally before the push ran.
    Gone,
    Failed(RemoteError),
}

/// Counts background work so callers can wait for it to drain.
#[derive(Default)]
struct Background {
    running: AtomicUsize,
    idle: Notify,
}

impl Background {
    fn enter(self: &Arc<Self>) -> BackgroundGuard {
        self.running.fetch_add(1, Ordering::SeqCst);
        BackgroundGuard(self.clone())
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

struct BackgroundGuard(Arc<Background>);

impl Drop for BackgroundGuard {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

type Fingerprint = Vec<(Uuid, TaskStatus, DateTime<Utc>)>;

fn fingerprint(items: &[TaskItem]) -> Fingerprint {
    let mut print: Fingerprint = items
        .iter()
        .map(|item| (item.id, item.status, item.updated_at))
        .collect();
    print.sort_by_key(|entry| entry.0);
    print
}

#[derive(Clone)]
pub struct SyncCoordinator {
    db: Arc<ClientDatabase>,
    remote: Arc<RemoteStoreClient>,
    session: Arc<SessionAuthenticator>,
    events: Arc<EventDispatcher>,
    workers: Arc<Semaphore>,
    background: Arc<Background>,
}

impl SyncCoordinator {
    pub fn new(
        db: Arc<ClientDatabase>,
        remote: Arc<RemoteStoreClient>,
        events: Arc<EventDispatcher>,
        worker_pool_size: usize,
    ) -> Self {
        Self {
            db,
            session: remote.session().clone(),
            remote,
            events,
            workers: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            background: Arc::new(Background::default()),
        }
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn database(&self) -> &Arc<ClientDatabase> {
        &self.db
    }

    /// Store a new task and push it in the background.
    pub async fn add(&self, item: TaskItem) -> SyncResult<TaskItem> {
        let item = self.store_local(item).await?;
        tracing::info!("COORDINATOR: Added task {}", item.id);
        self.spawn_push(item.id);
        Ok(item)
    }

    /// Replace a task and push it in the background.
    pub async fn update(&self, item: TaskItem) -> SyncResult<TaskItem> {
        let item = self.store_local(item).await?;
        tracing::info!("COORDINATOR: Updated task {}", item.id);
        self.spawn_push(item.id);
        Ok(item)
    }

    /// Delete a task locally; the remote delete is fire-and-forget.
    pub async fn delete(&self, id: Uuid) -> SyncResult<()> {
        let stamped = self
            .db
            .get_task(&id)
            .await?
            .map(|item| item.owner_identity)
            .unwrap_or_default();
        self.db.delete_task(&id).await?;
        self.events.emit_data_refreshed();
        tracing::info!("COORDINATOR: Deleted task {}", id);

        let this = self.clone();
        self.spawn_background(async move {
            let Some(owner) = this.signed_in_owner(&stamped).await else {
                return;
            };
            if let RemoteOutcome::Deferred(err) = this.remote.delete(&owner, id).await {
                tracing::warn!("COORDINATOR: Remote delete of {} dropped: {}", id, err);
            }
        });
        Ok(())
    }

    /// Push every unsynced task and report how many were synced.
    ///
    /// Pushes run concurrently; one failure does not stop the others. Items that could
    /// not be pushed stay unsynced and are picked up by the next call.
    pub async fn perform_sync(&self) -> SyncResult<usize> {
        let ids = self.db.get_unsynced_ids().await?;
        if ids.is_empty() {
            return Ok(0);
        }

        tracing::info!("COORDINATOR: Syncing {} unsynced tasks", ids.len());
        self.events.emit_sync_status(SyncState::Syncing);

        let mut pushes = JoinSet::new();
        for id in ids {
            let this = self.clone();
            pushes.spawn(async move {
                let _permit = this.workers.clone().acquire_owned().await.ok();
                (id, this.push_one(id).await)
            });
        }

        let mut synced = 0;
        let mut failed = 0;
        while let Some(joined) = pushes.join_next().await {
            match joined {
                Ok((_, Ok(PushResult::Synced))) => synced += 1,
                Ok((_, Ok(PushResult::Failed(_)))) => failed += 1,
                Ok((_, Ok(_))) => {}
                Ok((id, Err(e))) => {
                    tracing::error!("COORDINATOR: Push of {} failed locally: {}", id, e);
                    failed += 1;
                }
                Err(e) => {
                    tracing::error!("COORDINATOR: Push task panicked: {}", e);
                    failed += 1;
                }
            }
        }

        self.db.set_last_sync_time(&now()).await?;

        if failed == 0 {
            tracing::info!("COORDINATOR: Sync completed, {} tasks synced", synced);
            self.events.emit_sync_status(SyncState::Completed(synced));
            Ok(synced)
        } else {
            let err = SyncError::PartialSync { synced, failed };
            tracing::warn!("COORDINATOR: {}", err);
            self.events
                .emit_sync_status(SyncState::Failed(err.to_string()));
            Err(err)
        }
    }

    /// Current local tasks. Reconciliation with the remote runs in the background and
    /// emits `DataRefreshed` only if it changed what was returned here.
    pub async fn fetch(&self) -> SyncResult<Vec<TaskItem>> {
        let items = self.db.get_all_tasks().await?;
        let before = fingerprint(&items);

        let this = self.clone();
        self.spawn_background(async move {
            if let Err(e) = this.perform_sync().await {
                tracing::debug!("COORDINATOR: Background sync incomplete: {}", e);
            }
            if let Err(e) = this.pull_remote().await {
                tracing::warn!("COORDINATOR: Pull failed: {}", e);
            }
            match this.db.get_all_tasks().await {
                Ok(after) if fingerprint(&after) != before => this.events.emit_data_refreshed(),
                Ok(_) => {}
                Err(e) => tracing::error!("COORDINATOR: Failed to reload tasks: {}", e),
            }
        });

        Ok(items)
    }

    /// Bring remote state for the current identity into the local store.
    ///
    /// Newer remote copies replace synced local ones, missing ones are added, and synced
    /// local tasks the remote no longer has are dropped. Tasks with unpushed local edits
    /// are left alone. Returns the number of local changes.
    pub async fn pull_remote(&self) -> SyncResult<usize> {
        if !self.session.ensure_authenticated().await {
            return Ok(0);
        }
        let Some(owner) = self.session.current_identity() else {
            return Ok(0);
        };

        let cutoff = now();
        let remote_items = match self.remote.fetch_all(&owner).await {
            RemoteOutcome::Applied(items) => items,
            RemoteOutcome::Skipped | RemoteOutcome::Deferred(_) => return Ok(0),
        };

        // Writes are refused once the store has been handed to another identity.
        let mut changes = 0;
        let mut remote_ids = HashSet::with_capacity(remote_items.len());
        for item in &remote_items {
            remote_ids.insert(item.id);
            if self.db.apply_remote(&owner, item).await? {
                changes += 1;
            }
        }

        if self.session.current_identity().as_deref() != Some(owner.as_str()) {
            tracing::info!(
                "COORDINATOR: Identity changed during pull for {}, stopping",
                owner
            );
            return Ok(changes);
        }

        for local in self.db.get_all_tasks().await? {
            if !remote_ids.contains(&local.id)
                && self.db.delete_task_if_synced_before(&local.id, &cutoff).await?
            {
                tracing::debug!("COORDINATOR: Task {} was deleted remotely", local.id);
                changes += 1;
            }
        }

        tracing::info!(
            "COORDINATOR: Pulled {} remote tasks for {}, {} local changes",
            remote_items.len(),
            owner,
            changes
        );
        Ok(changes)
    }

    pub async fn count_pending(&self) -> SyncResult<usize> {
        self.db.count_unsynced().await
    }

    pub async fn last_sync_time(&self) -> SyncResult<Option<DateTime<Utc>>> {
        self.db.last_sync_time().await
    }

    /// Wait until every background push and reconciliation started so far has finished.
    pub async fn wait_for_background(&self) {
        self.background.wait_idle().await;
    }

    async fn store_local(&self, mut item: TaskItem) -> SyncResult<TaskItem> {
        item.touch(now());
        item.owner_identity = self.session.current_identity().unwrap_or_default();
        self.db.upsert_task(&item).await?;
        self.events.emit_data_refreshed();
        Ok(item)
    }

    fn spawn_push(&self, id: Uuid) {
        let this = self.clone();
        self.spawn_background(async move {
            let _permit = this.workers.clone().acquire_owned().await.ok();
            match this.push_one(id).await {
                Ok(result) => tracing::debug!("COORDINATOR: Push of {} -> {:?}", id, result),
                Err(e) => tracing::error!("COORDINATOR: Push of {} failed locally: {}", id, e),
            }
        });
    }

    pub(crate) fn spawn_background<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.background.enter();
        tokio::spawn(async move {
            work.await;
            drop(guard);
        });
    }

    /// The identity to run remote work as, if the session is signed in and `stamped` (an
    /// item's owner, empty when unowned) matches it.
    async fn signed_in_owner(&self, stamped: &str) -> Option<String> {
        if !self.session.ensure_authenticated().await {
            return None;
        }
        let owner = self.session.current_identity()?;
        if !stamped.is_empty() && stamped != owner {
            tracing::debug!(
                "COORDINATOR: Not syncing work of {} while signed in as {}",
                stamped,
                owner
            );
            return None;
        }
        Some(owner)
    }

    /// Push the current local copy of `id`.
    async fn push_one(&self, id: Uuid) -> SyncResult<PushResult> {
        if !self.session.ensure_authenticated().await {
            return Ok(PushResult::Skipped);
        }

        let Some(item) = self.db.get_task(&id).await? else {
            return Ok(PushResult::Gone);
        };

        let Some(owner) = self.signed_in_owner(&item.owner_identity).await else {
            return Ok(PushResult::Skipped);
        };

        match self.remote.save(&owner, &item).await {
            RemoteOutcome::Applied(_) => {
                if self.db.mark_synced_if_current(&id, &item.updated_at).await? {
                    Ok(PushResult::Synced)
                } else {
                    Ok(PushResult::Superseded)
                }
            }
            RemoteOutcome::Skipped => Ok(PushResult::Skipped),
            RemoteOutcome::Deferred(err) => {
                self.db
                    .set_sync_status(&id, false, Some(&err.to_string()))
                    .await?;
                Ok(PushResult::Failed(err))
            }
        }
    }
}
