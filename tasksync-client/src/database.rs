use crate::queries::{DbHelpers, Queries, TaskParams, CURRENT_IDENTITY_KEY, LAST_SYNC_TIME_KEY};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions},
    Row, Sqlite, SqlitePool,
};
use std::{str::FromStr, time::Duration};
use tasksync_core::{
    models::{now, SyncStatus, TaskItem},
    SyncResult,
};
use uuid::Uuid;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_task(query: SqliteQuery<'_>, params: TaskParams) -> SqliteQuery<'_> {
    query
        .bind(params.0) // id
        .bind(params.1) // owner_identity
        .bind(params.2) // title
        .bind(params.3) // note
        .bind(params.4) // priority
        .bind(params.5) // pinned
        .bind(params.6) // due_at
        .bind(params.7) // status
        .bind(params.8) // created_at
        .bind(params.9) // updated_at
        .bind(params.10) // asset_id
}

/// Durable on-device store: task rows plus their 1:1 sync status rows.
pub struct ClientDatabase {
    pub pool: SqlitePool,
}

impl ClientDatabase {
    pub async fn new(database_url: &str) -> SyncResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = if in_memory {
            // An in-memory database lives only as long as a connection to it.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> SyncResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn get_all_tasks(&self) -> SyncResult<Vec<TaskItem>> {
        let rows = sqlx::query(Queries::GET_ALL_TASKS)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(DbHelpers::parse_task).collect()
    }

    pub async fn get_task(&self, id: &Uuid) -> SyncResult<Option<TaskItem>> {
        let row = sqlx::query(Queries::GET_TASK)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(DbHelpers::parse_task).transpose()
    }

    /// Insert or replace a task and mark it unsynced, in one transaction.
    ///
    /// Repeating the call with identical content leaves identical state behind.
    pub async fn upsert_task(&self, task: &TaskItem) -> SyncResult<()> {
        tracing::debug!(
            "DATABASE: 💾 Upserting task {} (updated_at {})",
            task.id,
            task.updated_at
        );

        let mut tx = self.pool.begin().await?;

        bind_task(
            sqlx::query(Queries::UPSERT_TASK),
            DbHelpers::task_to_params(task),
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(Queries::MARK_UNSYNCED)
            .bind(task.id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Remove a task and its sync status. Returns whether the task existed.
    pub async fn delete_task(&self, id: &Uuid) -> SyncResult<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(Queries::DELETE_SYNC_STATUS)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(Queries::DELETE_TASK)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let existed = result.rows_affected() > 0;
        tracing::debug!("DATABASE: 🗑️ Deleted task {} (existed: {})", id, existed);
        Ok(existed)
    }

    pub async fn get_unsynced_ids(&self) -> SyncResult<Vec<Uuid>> {
        let rows = sqlx::query(Queries::GET_UNSYNCED_IDS)
            .fetch_all(&self.pool)
            .await?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            ids.push(Uuid::parse_str(&id)?);
        }
        Ok(ids)
    }

    pub async fn count_unsynced(&self) -> SyncResult<usize> {
        let row = sqlx::query(Queries::COUNT_UNSYNCED)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as usize)
    }

    /// Record the outcome of a push attempt.
    ///
    /// Creates the status row if the task exists without one. Returns `false` and writes
    /// nothing when the task itself is gone.
    pub async fn set_sync_status(
        &self,
        id: &Uuid,
        synced: bool,
        error: Option<&str>,
    ) -> SyncResult<bool> {
        let result = sqlx::query(Queries::SET_SYNC_STATUS)
            .bind(id.to_string())
            .bind(synced)
            .bind(DbHelpers::format_timestamp(&now()))
            .bind(error)
            .execute(&self.pool)
            .await?;

        let written = result.rows_affected() > 0;
        if !written {
            tracing::debug!("DATABASE: No task {} for sync status update", id);
        }
        Ok(written)
    }

    /// Mark a task synced only if the stored copy is the one that was pushed.
    pub async fn mark_synced_if_current(
        &self,
        id: &Uuid,
        pushed_updated_at: &DateTime<Utc>,
    ) -> SyncResult<bool> {
        let result = sqlx::query(Queries::MARK_SYNCED_IF_CURRENT)
            .bind(id.to_string())
            .bind(DbHelpers::format_timestamp(&now()))
            .bind(DbHelpers::format_timestamp(pushed_updated_at))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_sync_status(&self, id: &Uuid) -> SyncResult<Option<SyncStatus>> {
        let row = sqlx::query(Queries::GET_SYNC_STATUS)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(DbHelpers::parse_sync_status).transpose()
    }

    /// Store a copy received from `owner`'s remote account and mark it synced.
    ///
    /// Local copies with unpushed edits, or at least as new as the remote one, are kept,
    /// and nothing is written once the store's current identity is no longer `owner`.
    /// Returns whether anything was written.
    pub async fn apply_remote(&self, owner: &str, task: &TaskItem) -> SyncResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = bind_task(
            sqlx::query(Queries::APPLY_REMOTE_TASK),
            DbHelpers::task_to_params(task),
        )
        .bind(CURRENT_IDENTITY_KEY)
        .bind(owner)
        .execute(&mut *tx)
        .await?;

        let applied = result.rows_affected() > 0;
        if applied {
            sqlx::query(Queries::MARK_SYNCED)
                .bind(task.id.to_string())
                .bind(DbHelpers::format_timestamp(&now()))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        if applied {
            tracing::debug!("DATABASE: ⬇️ Applied remote copy of task {}", task.id);
        }
        Ok(applied)
    }

    /// Drop a task the remote no longer has, provided it is synced and its last
    /// confirmation predates `cutoff`. Returns whether it was removed.
    pub async fn delete_task_if_synced_before(
        &self,
        id: &Uuid,
        cutoff: &DateTime<Utc>,
    ) -> SyncResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(Queries::DELETE_SYNCED_STATUS_BEFORE)
            .bind(id.to_string())
            .bind(DbHelpers::format_timestamp(cutoff))
            .execute(&mut *tx)
            .await?;

        let removed = result.rows_affected() > 0;
        if removed {
            sqlx::query(Queries::DELETE_TASK)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(removed)
    }

    /// Wipe every task and sync status. Used on account change and logout.
    pub async fn clear_all(&self) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(Queries::DELETE_ALL_SYNC_STATUS)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(Queries::DELETE_ALL_TASKS)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            "DATABASE: 🧹 Cleared local store ({} tasks removed)",
            result.rows_affected()
        );
        Ok(())
    }

    pub async fn last_sync_time(&self) -> SyncResult<Option<DateTime<Utc>>> {
        self.get_state(LAST_SYNC_TIME_KEY)
            .await?
            .as_deref()
            .map(DbHelpers::parse_timestamp)
            .transpose()
    }

    pub async fn set_last_sync_time(&self, at: &DateTime<Utc>) -> SyncResult<()> {
        self.set_state(LAST_SYNC_TIME_KEY, &DbHelpers::format_timestamp(at))
            .await
    }

    pub async fn current_identity(&self) -> SyncResult<Option<String>> {
        self.get_state(CURRENT_IDENTITY_KEY).await
    }

    pub async fn set_current_identity(&self, identity: &str) -> SyncResult<()> {
        self.set_state(CURRENT_IDENTITY_KEY, identity).await
    }

    pub async fn clear_current_identity(&self) -> SyncResult<()> {
        sqlx::query(Queries::DELETE_APP_STATE)
            .bind(CURRENT_IDENTITY_KEY)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_state(&self, key: &str) -> SyncResult<Option<String>> {
        let row = sqlx::query(Queries::GET_APP_STATE)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.try_get::<String, _>("value")).transpose()?)
    }

    async fn set_state(&self, key: &str, value: &str) -> SyncResult<()> {
        sqlx::query(Queries::SET_APP_STATE)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
