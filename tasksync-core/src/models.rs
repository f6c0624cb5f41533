use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Record type name used on the wire for task records.
pub const TODO_RECORD_TYPE: &str = "TodoItem";

/// Current time at the precision every store in the system keeps (microseconds).
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskItem {
    pub id: Uuid,
    pub owner_identity: String,
    pub title: String,
    pub note: String,
    pub priority: i64,
    pub pinned: bool,
    pub due_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Opaque to the sync engine; owned by the presentation layer.
    pub asset_id: String,
}

impl TaskItem {
    pub fn new(title: impl Into<String>) -> Self {
        let created_at = now();
        Self {
            id: Uuid::new_v4(),
            owner_identity: String::new(),
            title: title.into(),
            note: String::new(),
            priority: 0,
            pinned: false,
            due_at: None,
            status: TaskStatus::default(),
            created_at,
            updated_at: created_at,
            asset_id: String::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Stamp a local mutation. `updated_at` never falls behind `created_at`.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        let at = at.trunc_subsecs(6);
        self.updated_at = if at < self.created_at {
            self.created_at
        } else {
            at
        };
    }
}

/// Per-item sync bookkeeping, 1:1 with a locally stored [`TaskItem`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncStatus {
    pub item_id: Uuid,
    pub synced: bool,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// The remote representation of a task.
///
/// `change_tag` is assigned by the record service on every write and is echoed back as
/// `expected_change_tag` by writers that fetched the record first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoRecord {
    pub record_type: String,
    pub id: Uuid,
    pub owner_identity: String,
    pub title: String,
    pub priority: i64,
    pub pinned: bool,
    pub due_date: Option<DateTime<Utc>>,
    pub note: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub asset_id: String,
    #[serde(default)]
    pub change_tag: Option<String>,
}

impl TodoRecord {
    pub fn from_item(item: &TaskItem) -> Self {
        Self {
            record_type: TODO_RECORD_TYPE.to_string(),
            id: item.id,
            owner_identity: item.owner_identity.clone(),
            title: item.title.clone(),
            priority: item.priority,
            pinned: item.pinned,
            due_date: item.due_at,
            note: item.note.clone(),
            status: item.status,
            created_at: item.created_at,
            updated_at: item.updated_at,
            asset_id: item.asset_id.clone(),
            change_tag: None,
        }
    }

    /// Whole-record overwrite with the caller's fields. The owner always comes from the
    /// session, never from the item.
    pub fn overwrite_from(&mut self, item: &TaskItem, owner_identity: &str) {
        self.owner_identity = owner_identity.to_string();
        self.title = item.title.clone();
        self.priority = item.priority;
        self.pinned = item.pinned;
        self.due_date = item.due_at;
        self.note = item.note.clone();
        self.status = item.status;
        self.created_at = item.created_at;
        self.updated_at = item.updated_at;
        self.asset_id = item.asset_id.clone();
    }

    pub fn into_item(self) -> TaskItem {
        TaskItem {
            id: self.id,
            owner_identity: self.owner_identity,
            title: self.title,
            note: self.note,
            priority: self.priority,
            pinned: self.pinned,
            due_at: self.due_date,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            asset_id: self.asset_id,
        }
    }
}
