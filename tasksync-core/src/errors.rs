use crate::protocol::ErrorCode;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("UUID parsing error: {0}")]
    UuidParse(#[from] uuid::Error),

    #[error("Date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("Enum parsing error: {0}")]
    EnumParse(#[from] strum::ParseError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("Sync incomplete: {synced} items synced, {failed} failed")]
    PartialSync { synced: usize, failed: usize },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Items pushed successfully before the failure, when the error carries that count.
    pub fn synced_count(&self) -> Option<usize> {
        match self {
            SyncError::PartialSync { synced, .. } => Some(*synced),
            _ => None,
        }
    }
}

/// Failures reported by the remote record service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Authentication expired")]
    AuthExpired,

    #[error("Remote quota exceeded")]
    QuotaExceeded,

    #[error("Remote record {0} changed since it was fetched")]
    RecordConflict(Uuid),

    #[error("Remote error: {0}")]
    Unknown(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::NetworkUnavailable(_)
                | RemoteError::AuthExpired
                | RemoteError::RecordConflict(_)
        )
    }

    pub fn from_error_code(code: ErrorCode, message: String, record_id: Option<Uuid>) -> Self {
        match code {
            ErrorCode::AuthExpired => RemoteError::AuthExpired,
            ErrorCode::QuotaExceeded => RemoteError::QuotaExceeded,
            ErrorCode::Conflict => RemoteError::RecordConflict(record_id.unwrap_or_default()),
            ErrorCode::InvalidMessage | ErrorCode::ServerError => RemoteError::Unknown(message),
        }
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to acquire lock: {0}")]
    LockError(String),
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Hashing error: {0}")]
    Hash(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<argon2::password_hash::Error> for SyncError {
    fn from(err: argon2::password_hash::Error) -> Self {
        SyncError::Server(ServerError::Hash(err.to_string()))
    }
}
