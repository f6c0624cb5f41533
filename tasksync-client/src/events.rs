//! Event bus for the sync client
//!
//! Components publish [`SyncEvent`]s through a shared [`EventDispatcher`]; the UI layer,
//! widgets and the account-change reactor observe them.
//!
//! Two ways to listen:
//!
//! - **Callbacks**: `register_callback` / `register_callback_filtered` take a closure that is
//!   invoked on the emitting task. Callbacks must not block.
//! - **Channels**: `subscribe` hands out an unbounded receiver, for async consumers that
//!   want to await events.
//!
//! Every subscriber registered when an event is emitted receives that event. Subscribers
//! whose receiver has been dropped are pruned on the next emission.

use std::sync::{Arc, Mutex};
use tasksync_core::{errors::ClientError, SyncResult};
use tokio::sync::mpsc;

/// Event types that can be emitted by the sync client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Local data changed and readers should reload
    DataRefreshed,
    /// Progress of a sync pass changed
    SyncStatusChanged,
    /// The remote reported a different account than the one stored locally
    AccountChanged,
    /// The remote revoked the session or became unusable
    RemoteUnavailable,
}

/// Progress of a `perform_sync` pass, as reported to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing pending; announced after the local store is wiped.
    Idle,
    Syncing,
    Completed(usize),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    DataRefreshed,
    SyncStatusChanged(SyncState),
    AccountChanged { identity: String },
    RemoteUnavailable,
}

impl SyncEvent {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            SyncEvent::DataRefreshed => EventType::DataRefreshed,
            SyncEvent::SyncStatusChanged(_) => EventType::SyncStatusChanged,
            SyncEvent::AccountChanged { .. } => EventType::AccountChanged,
            SyncEvent::RemoteUnavailable => EventType::RemoteUnavailable,
        }
    }
}

type Callback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Clone)]
struct CallbackEntry {
    callback: Callback,
    event_filter: Option<EventType>,
}

/// Fan-out of [`SyncEvent`]s to callbacks and channel subscribers.
pub struct EventDispatcher {
    callbacks: Mutex<Vec<CallbackEntry>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SyncEvent>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback for every event.
    ///
    /// ```rust,no_run
    /// use tasksync_client::events::{EventDispatcher, SyncEvent, SyncState};
    ///
    /// let dispatcher = EventDispatcher::new();
    ///
    /// dispatcher.register_callback(|event| {
    ///     match event {
    ///         SyncEvent::DataRefreshed => println!("reload list"),
    ///         SyncEvent::SyncStatusChanged(SyncState::Completed(n)) => {
    ///             println!("Synced {} tasks", n);
    ///         }
    ///         _ => {}
    ///     }
    /// }).unwrap();
    /// ```
    pub fn register_callback<F>(&self, callback: F) -> SyncResult<()>
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.push_callback(Arc::new(callback), None)
    }

    /// Register a callback that only receives events of `event_filter` type.
    pub fn register_callback_filtered<F>(
        &self,
        callback: F,
        event_filter: EventType,
    ) -> SyncResult<()>
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.push_callback(Arc::new(callback), Some(event_filter))
    }

    fn push_callback(&self, callback: Callback, event_filter: Option<EventType>) -> SyncResult<()> {
        let mut callbacks = self
            .callbacks
            .lock()
            .map_err(|_| ClientError::LockError("callbacks".into()))?;

        callbacks.push(CallbackEntry {
            callback,
            event_filter,
        });

        Ok(())
    }

    /// Open a channel that receives every event emitted from now on.
    pub fn subscribe(&self) -> SyncResult<mpsc::UnboundedReceiver<SyncEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|_| ClientError::LockError("subscribers".into()))?
            .push(tx);
        Ok(rx)
    }

    pub fn emit(&self, event: SyncEvent) {
        tracing::debug!("EVENTS: Emitting {:?}", event);

        // Snapshot so callbacks can register further callbacks without deadlocking.
        let callbacks: Vec<CallbackEntry> = match self.callbacks.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let event_type = event.event_type();
        for entry in callbacks {
            if entry.event_filter.map_or(true, |filter| filter == event_type) {
                (entry.callback)(&event);
            }
        }

        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn emit_data_refreshed(&self) {
        self.emit(SyncEvent::DataRefreshed);
    }

    pub fn emit_sync_status(&self, state: SyncState) {
        self.emit(SyncEvent::SyncStatusChanged(state));
    }

    pub fn emit_account_changed(&self, identity: &str) {
        self.emit(SyncEvent::AccountChanged {
            identity: identity.to_string(),
        });
    }

    pub fn emit_remote_unavailable(&self) {
        self.emit(SyncEvent::RemoteUnavailable);
    }

    pub fn subscriber_count(&self) -> usize {
        let callbacks = self.callbacks.lock().map(|c| c.len()).unwrap_or(0);
        let channels = self.subscribers.lock().map(|s| s.len()).unwrap_or(0);
        callbacks + channels
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
