use std::time::Duration;
use tasksync_core::{SyncError, SyncResult};

/// Settings for a [`crate::Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub database_url: String,
    pub server_url: String,
    pub identity: String,
    pub api_key: String,
    pub api_secret: String,
    /// Upper bound for any single remote call, authentication included.
    pub request_timeout: Duration,
    /// Consecutive authentication failures after which the remote is disabled.
    pub auth_failure_threshold: u32,
    /// First delay before a forced re-authentication; doubles on every reset up to
    /// `max_reset_delay`.
    pub reset_delay: Duration,
    pub max_reset_delay: Duration,
    /// Background pushes running at once.
    pub worker_pool_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:tasksync.sqlite3?mode=rwc".to_string(),
            server_url: "ws://localhost:8080/ws".to_string(),
            identity: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            request_timeout: Duration::from_secs(10),
            auth_failure_threshold: 2,
            reset_delay: Duration::from_secs(5),
            max_reset_delay: Duration::from_secs(300),
            worker_pool_size: 4,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `TASKSYNC_*` environment variables.
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("TASKSYNC_DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(url) = std::env::var("TASKSYNC_SERVER_URL") {
            config.server_url = url;
        }
        if let Ok(identity) = std::env::var("TASKSYNC_IDENTITY") {
            config.identity = identity;
        }
        if let Ok(key) = std::env::var("TASKSYNC_API_KEY") {
            config.api_key = key;
        }
        if let Ok(secret) = std::env::var("TASKSYNC_API_SECRET") {
            config.api_secret = secret;
        }
        if let Ok(secs) = std::env::var("TASKSYNC_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                SyncError::InvalidOperation(format!(
                    "TASKSYNC_REQUEST_TIMEOUT_SECS must be a whole number of seconds, got {:?}",
                    secs
                ))
            })?;
            config.request_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}
