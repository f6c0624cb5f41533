pub mod client;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod events;
pub mod memory;
pub mod queries;
pub mod reactor;
pub mod remote;
pub mod session;
pub mod transport;
pub mod websocket;

pub use client::Client;
pub use config::ClientConfig;
pub use coordinator::SyncCoordinator;
pub use database::ClientDatabase;
pub use events::{EventDispatcher, SyncEvent, SyncState};
pub use memory::InMemoryTransport;
pub use remote::{RemoteOutcome, RemoteStoreClient};
pub use session::SessionAuthenticator;
pub use transport::RecordTransport;
pub use websocket::WebSocketTransport;

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `tasksync_client=info`).
///
/// Does nothing if the host already installed one.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tasksync_client=info".into()),
        )
        .try_init();
}
