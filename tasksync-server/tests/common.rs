#![allow(dead_code)]

use std::sync::Arc;
use tasksync_core::models::{TaskItem, TodoRecord};
use tasksync_server::{auth::AuthState, database::ServerDatabase};
use uuid::Uuid;

/// Connect to `DATABASE_URL` and migrate, or explain why the test is skipped.
pub async fn setup_test_db() -> Result<ServerDatabase, Box<dyn std::error::Error>> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL environment variable not set")?;

    let db = ServerDatabase::new(&database_url).await?;
    db.run_migrations().await?;
    Ok(db)
}

/// An identity no other test uses, so tests can share one database.
pub fn unique_identity() -> String {
    format!("test-{}", Uuid::new_v4())
}

pub fn make_record(owner: &str, title: &str) -> TodoRecord {
    let mut item = TaskItem::new(title);
    item.owner_identity = owner.to_string();
    TodoRecord::from_item(&item)
}

pub async fn cleanup_identity(db: &ServerDatabase, identity: &str) {
    let _ = sqlx::query("DELETE FROM todo_records WHERE owner_identity = $1")
        .bind(identity)
        .execute(&db.pool)
        .await;
}

pub async fn saved_credentials(
    db: Arc<ServerDatabase>,
) -> (AuthState, tasksync_server::auth::ApiCredentials, Uuid) {
    let auth = AuthState::new(db);
    let credentials = AuthState::generate_api_credentials();
    let id = auth.save_credentials(&credentials, "test").await.unwrap();
    (auth, credentials, id)
}
