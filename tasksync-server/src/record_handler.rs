use crate::database::{SaveOutcome, ServerDatabase};
use std::sync::Arc;
use tasksync_core::{
    errors::ServerError,
    models::TodoRecord,
    protocol::{ClientMessage, ErrorCode, ServerMessage},
    SyncResult,
};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Serves record requests for one authenticated connection.
///
/// Every query is scoped to the session identity; records of other identities are
/// invisible, and writes always store the session identity as owner.
pub struct RecordHandler {
    db: Arc<ServerDatabase>,
    tx: mpsc::Sender<ServerMessage>,
    identity: String,
    record_quota: Option<i64>,
}

impl RecordHandler {
    pub fn new(
        db: Arc<ServerDatabase>,
        tx: mpsc::Sender<ServerMessage>,
        identity: String,
        record_quota: Option<i64>,
    ) -> Self {
        Self {
            db,
            tx,
            identity,
            record_quota,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Handle one request and send its response.
    ///
    /// Storage failures are reported to the client as `ServerError` for the same request;
    /// only a closed connection is returned as an error.
    pub async fn handle_message(&self, msg: ClientMessage) -> SyncResult<()> {
        let request_id = msg.request_id();
        let reply = match self.respond(msg).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(
                    "SERVER: Request {:?} from {} failed: {}",
                    request_id,
                    self.identity,
                    e
                );
                error_reply(
                    request_id,
                    ErrorCode::ServerError,
                    format!("Failed to process message: {}", e),
                )
            }
        };
        self.send(reply).await
    }

    async fn respond(&self, msg: ClientMessage) -> SyncResult<ServerMessage> {
        let reply = match msg {
            ClientMessage::FetchRecord { request_id, id } => {
                let record = self.db.fetch_record(&self.identity, &id).await?;
                tracing::debug!(
                    "SERVER: Fetch {} for {} -> found: {}",
                    id,
                    self.identity,
                    record.is_some()
                );
                ServerMessage::Record { request_id, record }
            }
            ClientMessage::SaveRecord {
                request_id,
                record,
                expected_change_tag,
            } => self.save(request_id, record, expected_change_tag).await?,
            ClientMessage::QueryRecords {
                request_id,
                owner_identity,
            } => {
                let records = if owner_identity == self.identity {
                    self.db.query_records(&self.identity).await?
                } else {
                    tracing::warn!(
                        "SERVER: {} asked for records of {}, returning none",
                        self.identity,
                        owner_identity
                    );
                    Vec::new()
                };
                tracing::debug!("SERVER: Query for {} -> {} records", self.identity, records.len());
                ServerMessage::Records {
                    request_id,
                    records,
                }
            }
            ClientMessage::DeleteRecord { request_id, id } => {
                let existed = self.db.delete_record(&self.identity, &id).await?;
                tracing::info!(
                    "SERVER: Delete {} for {} (existed: {})",
                    id,
                    self.identity,
                    existed
                );
                ServerMessage::Deleted {
                    request_id,
                    existed,
                }
            }
            ClientMessage::Ping => ServerMessage::Pong,
            ClientMessage::Authenticate { .. } => {
                error_reply(None, ErrorCode::InvalidMessage, "Already authenticated")
            }
        };
        Ok(reply)
    }

    async fn save(
        &self,
        request_id: Uuid,
        record: TodoRecord,
        expected_change_tag: Option<String>,
    ) -> SyncResult<ServerMessage> {
        let id = record.id;
        let outcome = self
            .db
            .save_record(
                &self.identity,
                &record,
                expected_change_tag.as_deref(),
                self.record_quota,
            )
            .await?;

        Ok(match outcome {
            SaveOutcome::Saved(record) => {
                tracing::info!("SERVER: Saved {} for {}", id, self.identity);
                ServerMessage::Record {
                    request_id,
                    record: Some(record),
                }
            }
            SaveOutcome::Conflict => {
                tracing::warn!("SERVER: Conflict saving {} for {}", id, self.identity);
                error_reply(
                    Some(request_id),
                    ErrorCode::Conflict,
                    format!("Record {} changed since it was fetched", id),
                )
            }
            SaveOutcome::QuotaExceeded => {
                tracing::warn!("SERVER: Quota exceeded for {}", self.identity);
                error_reply(Some(request_id), ErrorCode::QuotaExceeded, "Record quota exceeded")
            }
        })
    }

    async fn send(&self, message: ServerMessage) -> SyncResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| ServerError::ConnectionClosed)?;
        Ok(())
    }
}

pub fn error_reply(
    request_id: Option<Uuid>,
    code: ErrorCode,
    message: impl Into<String>,
) -> ServerMessage {
    ServerMessage::Error {
        request_id,
        code,
        message: message.into(),
    }
}
