//! In-process record service.
//!
//! Mirrors the server's record semantics (owner override, change-tag conflicts, owner
//! scoped queries, idempotent delete) and adds knobs for injecting failures and latency.

use crate::transport::{RecordTransport, RemoteResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tasksync_core::{change_tag::calculate_change_tag, errors::RemoteError, models::TodoRecord};
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    account: Option<String>,
    session_identity: Option<String>,
    records: HashMap<Uuid, TodoRecord>,
    record_quota: Option<usize>,

    auth_failure: Option<RemoteError>,
    auth_delay: Duration,
    request_failure: Option<RemoteError>,
    request_delay: Duration,
    record_failures: HashMap<Uuid, RemoteError>,
    one_shot_failures: VecDeque<RemoteError>,

    auth_calls: usize,
    request_calls: usize,
    active_auth: usize,
    max_concurrent_auth: usize,
}

pub struct InMemoryTransport {
    state: Mutex<MemoryState>,
}

impl InMemoryTransport {
    /// A service that will authenticate as `identity`.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                account: Some(identity.into()),
                ..Default::default()
            }),
        }
    }

    /// A service with no signed-in account; every authentication fails.
    pub fn signed_out() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Switch the signed-in account. The current session keeps its identity until it
    /// expires or is re-established.
    pub fn set_account(&self, identity: Option<&str>) {
        self.state().account = identity.map(str::to_string);
    }

    pub fn expire_session(&self) {
        self.state().session_identity = None;
    }

    pub fn set_auth_failure(&self, failure: Option<RemoteError>) {
        self.state().auth_failure = failure;
    }

    pub fn set_auth_delay(&self, delay: Duration) {
        self.state().auth_delay = delay;
    }

    /// Fail every record request with `failure` until cleared.
    pub fn fail_requests_with(&self, failure: Option<RemoteError>) {
        self.state().request_failure = failure;
    }

    /// Fail requests touching `id` until cleared with [`Self::clear_record_failure`].
    pub fn fail_record(&self, id: Uuid, failure: RemoteError) {
        self.state().record_failures.insert(id, failure);
    }

    pub fn clear_record_failure(&self, id: &Uuid) {
        self.state().record_failures.remove(id);
    }

    /// Fail only the next record request.
    pub fn fail_next_request(&self, failure: RemoteError) {
        self.state().one_shot_failures.push_back(failure);
    }

    pub fn set_request_delay(&self, delay: Duration) {
        self.state().request_delay = delay;
    }

    pub fn set_record_quota(&self, quota: Option<usize>) {
        self.state().record_quota = quota;
    }

    /// Place a record directly, as another device would have written it.
    pub fn insert_record(&self, mut record: TodoRecord) {
        record.change_tag = Some(calculate_change_tag(&record));
        self.state().records.insert(record.id, record);
    }

    pub fn remove_record(&self, id: &Uuid) -> Option<TodoRecord> {
        self.state().records.remove(id)
    }

    pub fn record(&self, id: &Uuid) -> Option<TodoRecord> {
        self.state().records.get(id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.state().records.len()
    }

    pub fn auth_calls(&self) -> usize {
        self.state().auth_calls
    }

    pub fn request_calls(&self) -> usize {
        self.state().request_calls
    }

    pub fn max_concurrent_auth(&self) -> usize {
        self.state().max_concurrent_auth
    }

    /// Account a request to the session it was sent on, as a connection would.
    async fn begin_request(&self, record_id: Option<Uuid>) -> RemoteResult<String> {
        let (delay, session) = {
            let mut state = self.state();
            state.request_calls += 1;
            (state.request_delay, state.session_identity.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(failure) = state.one_shot_failures.pop_front() {
            return Err(failure);
        }
        if let Some(failure) = state.request_failure.clone() {
            return Err(failure);
        }
        if let Some(failure) = record_id.and_then(|id| state.record_failures.get(&id).cloned()) {
            return Err(failure);
        }
        session.ok_or(RemoteError::AuthExpired)
    }
}

/// Counts an authentication as in flight until dropped, including when cancelled.
struct AuthInFlight<'a>(&'a InMemoryTransport);

impl Drop for AuthInFlight<'_> {
    fn drop(&mut self) {
        self.0.state().active_auth -= 1;
    }
}

#[async_trait]
impl RecordTransport for InMemoryTransport {
    async fn authenticate(&self) -> RemoteResult<String> {
        let delay = {
            let mut state = self.state();
            state.auth_calls += 1;
            state.active_auth += 1;
            state.max_concurrent_auth = state.max_concurrent_auth.max(state.active_auth);
            state.auth_delay
        };
        let in_flight = AuthInFlight(self);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        drop(in_flight);

        let mut state = self.state();
        if let Some(failure) = state.auth_failure.clone() {
            return Err(failure);
        }
        let identity = state
            .account
            .clone()
            .ok_or_else(|| RemoteError::Unknown("no account signed in".to_string()))?;
        state.session_identity = Some(identity.clone());
        Ok(identity)
    }

    async fn fetch_record(&self, id: Uuid) -> RemoteResult<Option<TodoRecord>> {
        let owner = self.begin_request(Some(id)).await?;
        let state = self.state();
        Ok(state
            .records
            .get(&id)
            .filter(|record| record.owner_identity == owner)
            .cloned())
    }

    async fn save_record(
        &self,
        mut record: TodoRecord,
        expected_change_tag: Option<String>,
    ) -> RemoteResult<TodoRecord> {
        let owner = self.begin_request(Some(record.id)).await?;
        let mut state = self.state();

        let existing = state
            .records
            .get(&record.id)
            .filter(|existing| existing.owner_identity == owner);
        let current_tag = existing.and_then(|existing| existing.change_tag.clone());
        if existing.is_some() != expected_change_tag.is_some() || current_tag != expected_change_tag
        {
            return Err(RemoteError::RecordConflict(record.id));
        }

        if existing.is_none() {
            if let Some(quota) = state.record_quota {
                let owned = state
                    .records
                    .values()
                    .filter(|r| r.owner_identity == owner)
                    .count();
                if owned >= quota {
                    return Err(RemoteError::QuotaExceeded);
                }
            }
        }

        record.owner_identity = owner;
        record.change_tag = Some(calculate_change_tag(&record));
        state.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn query_records(&self, owner_identity: &str) -> RemoteResult<Vec<TodoRecord>> {
        let owner = self.begin_request(None).await?;
        if owner != owner_identity {
            return Ok(Vec::new());
        }

        let state = self.state();
        let mut records: Vec<TodoRecord> = state
            .records
            .values()
            .filter(|record| record.owner_identity == owner)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn delete_record(&self, id: Uuid) -> RemoteResult<bool> {
        let owner = self.begin_request(Some(id)).await?;
        let mut state = self.state();

        let owned = state
            .records
            .get(&id)
            .is_some_and(|record| record.owner_identity == owner);
        if owned {
            state.records.remove(&id);
        }
        Ok(owned)
    }
}
