use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Row};
use std::str::FromStr;
use tasksync_core::{
    models::{TaskStatus, TodoRecord},
    SyncResult,
};
use uuid::Uuid;

/// Type alias for record parameters tuple
pub type RecordParams = (
    String,                // owner_identity
    Uuid,                  // id
    String,                // record_type
    String,                // title
    String,                // note
    i64,                   // priority
    bool,                  // pinned
    Option<DateTime<Utc>>, // due_date
    String,                // status
    DateTime<Utc>,         // created_at
    DateTime<Utc>,         // updated_at
    String,                // asset_id
    String,                // change_tag
);

/// SQL queries for the record service
pub struct Queries;

impl Queries {
    pub const GET_RECORD: &'static str = r#"
        SELECT owner_identity, id, record_type, title, note, priority, pinned,
               due_date, status, created_at, updated_at, asset_id, change_tag
        FROM todo_records
        WHERE owner_identity = $1 AND id = $2
    "#;

    pub const GET_RECORD_FOR_UPDATE: &'static str = r#"
        SELECT owner_identity, id, record_type, title, note, priority, pinned,
               due_date, status, created_at, updated_at, asset_id, change_tag
        FROM todo_records
        WHERE owner_identity = $1 AND id = $2
        FOR UPDATE
    "#;

    pub const INSERT_RECORD: &'static str = r#"
        INSERT INTO todo_records (
            owner_identity, id, record_type, title, note, priority, pinned,
            due_date, status, created_at, updated_at, asset_id, change_tag
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
    "#;

    pub const UPDATE_RECORD: &'static str = r#"
        UPDATE todo_records SET
            record_type = $3,
            title = $4,
            note = $5,
            priority = $6,
            pinned = $7,
            due_date = $8,
            status = $9,
            created_at = $10,
            updated_at = $11,
            asset_id = $12,
            change_tag = $13
        WHERE owner_identity = $1 AND id = $2
    "#;

    pub const QUERY_RECORDS: &'static str = r#"
        SELECT owner_identity, id, record_type, title, note, priority, pinned,
               due_date, status, created_at, updated_at, asset_id, change_tag
        FROM todo_records
        WHERE owner_identity = $1
        ORDER BY created_at DESC, id
    "#;

    pub const DELETE_RECORD: &'static str =
        "DELETE FROM todo_records WHERE owner_identity = $1 AND id = $2";

    pub const COUNT_RECORDS: &'static str =
        "SELECT COUNT(*) AS count FROM todo_records WHERE owner_identity = $1";

    // Credential queries
    pub const INSERT_CREDENTIALS: &'static str = r#"
        INSERT INTO api_credentials (api_key_hash, secret, name)
        VALUES ($1, $2, $3)
        RETURNING id
    "#;

    pub const GET_ACTIVE_CREDENTIALS: &'static str =
        "SELECT id, api_key_hash, secret FROM api_credentials WHERE is_active = true";

    pub const TOUCH_CREDENTIALS: &'static str =
        "UPDATE api_credentials SET last_used_at = NOW() WHERE id = $1";

    pub const DEACTIVATE_CREDENTIALS: &'static str =
        "UPDATE api_credentials SET is_active = false WHERE id = $1";
}

/// Parse a record from a database row
pub fn parse_record(row: &PgRow) -> SyncResult<TodoRecord> {
    let status: String = row.try_get("status")?;
    Ok(TodoRecord {
        record_type: row.try_get("record_type")?,
        id: row.try_get("id")?,
        owner_identity: row.try_get("owner_identity")?,
        title: row.try_get("title")?,
        priority: row.try_get("priority")?,
        pinned: row.try_get("pinned")?,
        due_date: row.try_get("due_date")?,
        note: row.try_get("note")?,
        status: TaskStatus::from_str(&status)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        asset_id: row.try_get("asset_id")?,
        change_tag: Some(row.try_get("change_tag")?),
    })
}

/// Prepare record values for database insertion
pub fn record_to_params(record: &TodoRecord, change_tag: String) -> RecordParams {
    (
        record.owner_identity.clone(),
        record.id,
        record.record_type.clone(),
        record.title.clone(),
        record.note.clone(),
        record.priority,
        record.pinned,
        record.due_date,
        record.status.to_string(),
        record.created_at,
        record.updated_at,
        record.asset_id.clone(),
        change_tag,
    )
}
