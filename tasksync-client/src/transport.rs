//! The seam between the remote store client and the record service.
//!
//! Implementations: [`crate::websocket::WebSocketTransport`] talks to `tasksync-server`,
//! [`crate::memory::InMemoryTransport`] keeps records in process.

use async_trait::async_trait;
use tasksync_core::{errors::RemoteError, models::TodoRecord};
use uuid::Uuid;

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Raw record-service operations. Calls are scoped to whatever identity the transport
/// last authenticated as; callers never pick the owner.
#[async_trait]
pub trait RecordTransport: Send + Sync {
    /// Establish (or re-establish) a session. Returns the remote identity.
    async fn authenticate(&self) -> RemoteResult<String>;

    async fn fetch_record(&self, id: Uuid) -> RemoteResult<Option<TodoRecord>>;

    /// Write a whole record. `expected_change_tag` is the tag seen by the caller's fetch,
    /// `None` when the caller believes the record does not exist yet.
    async fn save_record(
        &self,
        record: TodoRecord,
        expected_change_tag: Option<String>,
    ) -> RemoteResult<TodoRecord>;

    /// Records owned by `owner_identity`, newest `created_at` first.
    async fn query_records(&self, owner_identity: &str) -> RemoteResult<Vec<TodoRecord>>;

    /// Returns whether the record existed.
    async fn delete_record(&self, id: Uuid) -> RemoteResult<bool>;
}
