use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use std::str::FromStr;
use tasksync_core::{
    models::{SyncStatus, TaskItem, TaskStatus},
    SyncResult,
};
use uuid::Uuid;

/// Type alias for task parameters tuple
pub type TaskParams = (
    String,         // id
    String,         // owner_identity
    String,         // title
    String,         // note
    i64,            // priority
    bool,           // pinned
    Option<String>, // due_at
    String,         // status
    String,         // created_at
    String,         // updated_at
    String,         // asset_id
);

/// Scalar keys stored in `app_state`
pub const LAST_SYNC_TIME_KEY: &str = "lastSyncTime";
pub const CURRENT_IDENTITY_KEY: &str = "currentIdentity";

/// SQL queries for the local store
pub struct Queries;

impl Queries {
    // Task queries
    pub const GET_ALL_TASKS: &'static str = r#"
        SELECT id, owner_identity, title, note, priority, pinned, due_at,
               status, created_at, updated_at, asset_id
        FROM tasks
        ORDER BY id
    "#;

    pub const GET_TASK: &'static str = r#"
        SELECT id, owner_identity, title, note, priority, pinned, due_at,
               status, created_at, updated_at, asset_id
        FROM tasks
        WHERE id = ?1
    "#;

    pub const UPSERT_TASK: &'static str = r#"
        INSERT INTO tasks (
            id, owner_identity, title, note, priority, pinned, due_at,
            status, created_at, updated_at, asset_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(id) DO UPDATE SET
            owner_identity = excluded.owner_identity,
            title = excluded.title,
            note = excluded.note,
            priority = excluded.priority,
            pinned = excluded.pinned,
            due_at = excluded.due_at,
            status = excluded.status,
            updated_at = excluded.updated_at,
            asset_id = excluded.asset_id
    "#;

    /// Only overwrites a local copy that is older and has no unpushed edits, and only
    /// while the store still belongs to the identity in ?13 (app state key ?12).
    pub const APPLY_REMOTE_TASK: &'static str = r#"
        INSERT INTO tasks (
            id, owner_identity, title, note, priority, pinned, due_at,
            status, created_at, updated_at, asset_id
        )
        SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11
        WHERE EXISTS (SELECT 1 FROM app_state WHERE key = ?12 AND value = ?13)
        ON CONFLICT(id) DO UPDATE SET
            owner_identity = excluded.owner_identity,
            title = excluded.title,
            note = excluded.note,
            priority = excluded.priority,
            pinned = excluded.pinned,
            due_at = excluded.due_at,
            status = excluded.status,
            updated_at = excluded.updated_at,
            asset_id = excluded.asset_id
        WHERE tasks.updated_at < excluded.updated_at
          AND NOT EXISTS (
              SELECT 1 FROM sync_status
              WHERE sync_status.item_id = excluded.id AND sync_status.synced = 0
          )
    "#;

    pub const DELETE_TASK: &'static str = "DELETE FROM tasks WHERE id = ?1";

    pub const DELETE_ALL_TASKS: &'static str = "DELETE FROM tasks";

    // Sync status queries
    pub const MARK_UNSYNCED: &'static str = r#"
        INSERT INTO sync_status (item_id, synced, last_attempt_at, last_error)
        VALUES (?1, 0, NULL, NULL)
        ON CONFLICT(item_id) DO UPDATE SET
            synced = 0,
            last_error = NULL
    "#;

    pub const MARK_SYNCED: &'static str = r#"
        INSERT INTO sync_status (item_id, synced, last_attempt_at, last_error)
        VALUES (?1, 1, ?2, NULL)
        ON CONFLICT(item_id) DO UPDATE SET
            synced = 1,
            last_attempt_at = excluded.last_attempt_at,
            last_error = NULL
    "#;

    /// Never creates a status row for an id that has no task.
    pub const SET_SYNC_STATUS: &'static str = r#"
        INSERT INTO sync_status (item_id, synced, last_attempt_at, last_error)
        SELECT ?1, ?2, ?3, ?4
        WHERE EXISTS (SELECT 1 FROM tasks WHERE id = ?1)
        ON CONFLICT(item_id) DO UPDATE SET
            synced = excluded.synced,
            last_attempt_at = excluded.last_attempt_at,
            last_error = excluded.last_error
    "#;

    pub const MARK_SYNCED_IF_CURRENT: &'static str = r#"
        UPDATE sync_status
        SET synced = 1, last_attempt_at = ?2, last_error = NULL
        WHERE item_id = ?1
          AND EXISTS (SELECT 1 FROM tasks WHERE id = ?1 AND updated_at = ?3)
    "#;

    pub const GET_SYNC_STATUS: &'static str = r#"
        SELECT item_id, synced, last_attempt_at, last_error
        FROM sync_status
        WHERE item_id = ?1
    "#;

    /// A task without a status row counts as unsynced.
    pub const GET_UNSYNCED_IDS: &'static str = r#"
        SELECT t.id AS id
        FROM tasks t
        LEFT JOIN sync_status s ON s.item_id = t.id
        WHERE s.synced IS NULL OR s.synced = 0
        ORDER BY t.id
    "#;

    pub const COUNT_UNSYNCED: &'static str = r#"
        SELECT COUNT(*) AS count
        FROM tasks t
        LEFT JOIN sync_status s ON s.item_id = t.id
        WHERE s.synced IS NULL OR s.synced = 0
    "#;

    pub const DELETE_SYNC_STATUS: &'static str = "DELETE FROM sync_status WHERE item_id = ?1";

    pub const DELETE_SYNCED_STATUS_BEFORE: &'static str = r#"
        DELETE FROM sync_status
        WHERE item_id = ?1 AND synced = 1 AND last_attempt_at < ?2
    "#;

    pub const DELETE_ALL_SYNC_STATUS: &'static str = "DELETE FROM sync_status";

    // Scalar state queries
    pub const GET_APP_STATE: &'static str = "SELECT value FROM app_state WHERE key = ?1";

    pub const SET_APP_STATE: &'static str = r#"
        INSERT INTO app_state (key, value) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
    "#;

    pub const DELETE_APP_STATE: &'static str = "DELETE FROM app_state WHERE key = ?1";
}

/// Helper functions for common database operations
pub struct DbHelpers;

impl DbHelpers {
    /// Fixed-width UTC form so stored timestamps compare correctly as text.
    pub fn format_timestamp(at: &DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn parse_timestamp(value: &str) -> SyncResult<DateTime<Utc>> {
        Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
    }

    /// Parse a task from a database row
    pub fn parse_task(row: &SqliteRow) -> SyncResult<TaskItem> {
        let id: String = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let due_at: Option<String> = row.try_get("due_at")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(TaskItem {
            id: Uuid::parse_str(&id)?,
            owner_identity: row.try_get("owner_identity")?,
            title: row.try_get("title")?,
            note: row.try_get("note")?,
            priority: row.try_get("priority")?,
            pinned: row.try_get("pinned")?,
            due_at: due_at.as_deref().map(Self::parse_timestamp).transpose()?,
            status: TaskStatus::from_str(&status)?,
            created_at: Self::parse_timestamp(&created_at)?,
            updated_at: Self::parse_timestamp(&updated_at)?,
            asset_id: row.try_get("asset_id")?,
        })
    }

    pub fn parse_sync_status(row: &SqliteRow) -> SyncResult<SyncStatus> {
        let item_id: String = row.try_get("item_id")?;
        let last_attempt_at: Option<String> = row.try_get("last_attempt_at")?;

        Ok(SyncStatus {
            item_id: Uuid::parse_str(&item_id)?,
            synced: row.try_get("synced")?,
            last_attempt_at: last_attempt_at
                .as_deref()
                .map(Self::parse_timestamp)
                .transpose()?,
            last_error: row.try_get("last_error")?,
        })
    }

    /// Prepare task values for database insertion
    pub fn task_to_params(task: &TaskItem) -> TaskParams {
        (
            task.id.to_string(),
            task.owner_identity.clone(),
            task.title.clone(),
            task.note.clone(),
            task.priority,
            task.pinned,
            task.due_at.as_ref().map(Self::format_timestamp),
            task.status.to_string(),
            Self::format_timestamp(&task.created_at),
            Self::format_timestamp(&task.updated_at),
            task.asset_id.clone(),
        )
    }
}
