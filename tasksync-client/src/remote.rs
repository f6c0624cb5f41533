//! Authenticated CRUD against the record service.
//!
//! Nothing here fails a caller: every operation resolves to a [`RemoteOutcome`]. When the
//! session cannot be established the call is `Skipped` without touching the network, and
//! remote errors come back as `Deferred` for the caller to record and retry later.

use crate::{
    session::SessionAuthenticator,
    transport::{RecordTransport, RemoteResult},
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tasksync_core::{
    errors::RemoteError,
    models::{TaskItem, TodoRecord},
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome<T> {
    /// The remote acknowledged the operation.
    Applied(T),
    /// The remote is unavailable, or signed in as someone else; the result was dropped.
    Skipped,
    /// The remote rejected or failed the operation.
    Deferred(RemoteError),
}

impl<T> RemoteOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, RemoteOutcome::Applied(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            RemoteOutcome::Applied(value) => Some(value),
            _ => None,
        }
    }
}

pub struct RemoteStoreClient {
    transport: Arc<dyn RecordTransport>,
    session: Arc<SessionAuthenticator>,
    request_timeout: Duration,
}

impl RemoteStoreClient {
    pub fn new(
        transport: Arc<dyn RecordTransport>,
        session: Arc<SessionAuthenticator>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            session,
            request_timeout,
        }
    }

    pub fn session(&self) -> &Arc<SessionAuthenticator> {
        &self.session
    }

    /// Fetch-or-create `item` remotely in `owner`'s account and overwrite it with the
    /// caller's fields.
    ///
    /// The stored owner is `owner`, whatever `item` says.
    pub async fn save(&self, owner: &str, item: &TaskItem) -> RemoteOutcome<TaskItem> {
        let transport = &self.transport;
        self.guarded("save", owner, Some(item.id), move || async move {
            let existing = transport.fetch_record(item.id).await?;
            let expected_tag = existing.as_ref().and_then(|r| r.change_tag.clone());

            let mut record = existing.unwrap_or_else(|| TodoRecord::from_item(item));
            record.overwrite_from(item, owner);

            let saved = transport.save_record(record, expected_tag).await?;
            Ok(saved.into_item())
        })
        .await
    }

    /// Overwrite an existing remote record.
    ///
    /// A record the remote no longer has is not recreated; the caller's copy is returned
    /// as the result.
    pub async fn update(&self, owner: &str, item: &TaskItem) -> RemoteOutcome<TaskItem> {
        let transport = &self.transport;
        self.guarded("update", owner, Some(item.id), move || async move {
            match transport.fetch_record(item.id).await? {
                Some(mut record) => {
                    let expected_tag = record.change_tag.clone();
                    record.overwrite_from(item, owner);
                    let saved = transport.save_record(record, expected_tag).await?;
                    Ok(saved.into_item())
                }
                None => {
                    tracing::debug!(
                        "REMOTE: Task {} is gone remotely, keeping local copy",
                        item.id
                    );
                    Ok(item.clone())
                }
            }
        })
        .await
    }

    /// Delete a record. A record that is already gone counts as deleted.
    pub async fn delete(&self, owner: &str, id: Uuid) -> RemoteOutcome<()> {
        let transport = &self.transport;
        self.guarded("delete", owner, Some(id), move || async move {
            let existed = transport.delete_record(id).await?;
            if !existed {
                tracing::debug!("REMOTE: Task {} was already deleted remotely", id);
            }
            Ok(())
        })
        .await
    }

    /// Every remote task owned by `owner`, newest first.
    ///
    /// Only the session's own identity can be queried; asking for anyone else is
    /// `Skipped`.
    pub async fn fetch_all(&self, owner: &str) -> RemoteOutcome<Vec<TaskItem>> {
        let transport = &self.transport;
        self.guarded("fetch_all", owner, None, move || async move {
            let records = transport.query_records(owner).await?;
            Ok(records
                .into_iter()
                .filter(|record| record.owner_identity == owner)
                .map(TodoRecord::into_item)
                .collect())
        })
        .await
    }

    /// Authenticate as `owner`, run `op` under the request timeout, and absorb its
    /// failure.
    ///
    /// The call is `Skipped` when the session is not signed in as `owner`, before the
    /// request or by the time it returns. `AuthExpired` refreshes the session and
    /// retries once; `RecordConflict` retries once, which refetches the record.
    async fn guarded<T, F, Fut>(
        &self,
        operation: &str,
        owner: &str,
        record: Option<Uuid>,
        op: F,
    ) -> RemoteOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        if !self.session.ensure_authenticated().await {
            tracing::debug!("REMOTE: {} skipped, remote unavailable", operation);
            return RemoteOutcome::Skipped;
        }

        let mut refreshed = false;
        let mut refetched = false;
        loop {
            if !self.signed_in_as(operation, owner) {
                return RemoteOutcome::Skipped;
            }

            let result = match tokio::time::timeout(self.request_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::NetworkUnavailable(format!(
                    "{} timed out after {:?}",
                    operation, self.request_timeout
                ))),
            };

            if !self.signed_in_as(operation, owner) {
                return RemoteOutcome::Skipped;
            }

            match result {
                Ok(value) => return RemoteOutcome::Applied(value),
                Err(RemoteError::AuthExpired) if !refreshed => {
                    refreshed = true;
                    if !self.session.refresh_authentication().await {
                        tracing::warn!(
                            "REMOTE: {} deferred, session could not be refreshed",
                            operation
                        );
                        return RemoteOutcome::Deferred(RemoteError::AuthExpired);
                    }
                }
                Err(RemoteError::RecordConflict(id)) if !refetched => {
                    refetched = true;
                    tracing::debug!("REMOTE: Task {} changed remotely, refetching", id);
                }
                Err(err) => {
                    if err.is_retryable() {
                        tracing::warn!(
                            "REMOTE: {} of {:?} failed, will retry later: {}",
                            operation,
                            record,
                            err
                        );
                    } else {
                        tracing::error!("REMOTE: {} of {:?} failed: {}", operation, record, err);
                    }
                    return RemoteOutcome::Deferred(err);
                }
            }
        }
    }

    fn signed_in_as(&self, operation: &str, owner: &str) -> bool {
        let current = self.session.current_identity();
        if current.as_deref() == Some(owner) {
            return true;
        }
        tracing::warn!(
            "REMOTE: {} for {} skipped, session is signed in as {:?}",
            operation,
            owner,
            current
        );
        false
    }
}
