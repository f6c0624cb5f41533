use crate::models::TodoRecord;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Authentication
    Authenticate {
        identity: String,
        api_key: String,
        signature: String,
        timestamp: i64,
    },

    // Record operations
    FetchRecord {
        request_id: Uuid,
        id: Uuid,
    },
    SaveRecord {
        request_id: Uuid,
        record: TodoRecord,
        expected_change_tag: Option<String>,
    },
    QueryRecords {
        request_id: Uuid,
        owner_identity: String,
    },
    DeleteRecord {
        request_id: Uuid,
        id: Uuid,
    },

    // Heartbeat
    Ping,
}

impl ClientMessage {
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            ClientMessage::FetchRecord { request_id, .. }
            | ClientMessage::SaveRecord { request_id, .. }
            | ClientMessage::QueryRecords { request_id, .. }
            | ClientMessage::DeleteRecord { request_id, .. } => Some(*request_id),
            ClientMessage::Authenticate { .. } | ClientMessage::Ping => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Authentication responses
    AuthSuccess {
        session_id: Uuid,
        identity: String,
    },
    AuthError {
        reason: String,
    },

    // Record responses
    Record {
        request_id: Uuid,
        record: Option<TodoRecord>,
    },
    Records {
        request_id: Uuid,
        records: Vec<TodoRecord>,
    },
    Deleted {
        request_id: Uuid,
        existed: bool,
    },

    // Errors
    Error {
        request_id: Option<Uuid>,
        code: ErrorCode,
        message: String,
    },

    // Pushed by the server when the session owner signs out or loses access
    SessionRevoked {
        reason: String,
    },

    // Heartbeat
    Pong,
}

impl ServerMessage {
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            ServerMessage::Record { request_id, .. }
            | ServerMessage::Records { request_id, .. }
            | ServerMessage::Deleted { request_id, .. } => Some(*request_id),
            ServerMessage::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthExpired,
    QuotaExceeded,
    Conflict,
    InvalidMessage,
    ServerError,
}
