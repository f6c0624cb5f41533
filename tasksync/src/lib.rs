//! Tasksync - offline-first task synchronization
//!
//! This crate provides a unified API for the tasksync system.
//!
//! # Example
//!
//! ```ignore
//! use tasksync::{Client, ClientConfig, TaskItem};
//!
//! let client = Client::new(ClientConfig::from_env()?).await?;
//! let task = client.add(TaskItem::new("Buy milk")).await?;
//! client.perform_sync().await?;
//! ```

// Re-export client types
pub use tasksync_client::{
    init_tracing, Client, ClientConfig, EventDispatcher, InMemoryTransport, RecordTransport,
    RemoteOutcome, SyncEvent, SyncState, WebSocketTransport,
};

// Re-export server types
pub use tasksync_server::AppState as Server;

// Re-export core types that external applications may need
pub use tasksync_core::errors::{RemoteError, SyncError};
pub use tasksync_core::models::{SyncStatus, TaskItem, TaskStatus, TodoRecord};
pub use tasksync_core::protocol::{ClientMessage, ServerMessage};
pub use tasksync_core::SyncResult;
