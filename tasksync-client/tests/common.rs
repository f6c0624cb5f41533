#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tasksync_client::{
    Client, ClientConfig, ClientDatabase, EventDispatcher, InMemoryTransport, SyncEvent,
};
use tasksync_core::models::TaskItem;

pub async fn setup_test_db() -> ClientDatabase {
    let db = ClientDatabase::new("sqlite::memory:").await.unwrap();
    db.run_migrations().await.unwrap();
    db
}

pub fn make_task(title: &str, priority: i64) -> TaskItem {
    TaskItem::new(title).with_priority(priority)
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        database_url: "sqlite::memory:".to_string(),
        request_timeout: Duration::from_secs(2),
        reset_delay: Duration::from_millis(20),
        max_reset_delay: Duration::from_millis(200),
        ..ClientConfig::default()
    }
}

pub async fn setup_client(transport: Arc<InMemoryTransport>) -> Client {
    setup_client_with(test_config(), transport).await
}

pub async fn setup_client_with(config: ClientConfig, transport: Arc<InMemoryTransport>) -> Client {
    Client::with_transport(config, transport, Arc::new(EventDispatcher::new()))
        .await
        .unwrap()
}

/// Record every event emitted from now on.
pub fn record_events(events: &EventDispatcher) -> Arc<Mutex<Vec<SyncEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    events
        .register_callback(move |event| sink.lock().unwrap().push(event.clone()))
        .unwrap();
    seen
}

/// Poll `check` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
