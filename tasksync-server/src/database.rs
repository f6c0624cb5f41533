use crate::queries::{parse_record, record_to_params, Queries, RecordParams};
use sqlx::{
    postgres::{PgArguments, PgPoolOptions},
    query::Query,
    PgPool, Postgres, Row,
};
use tasksync_core::{
    change_tag::calculate_change_tag, models::TodoRecord, SyncError, SyncResult,
};
use uuid::Uuid;

/// Result of a conditional record write.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved(TodoRecord),
    /// The stored change tag did not match the one the writer expected.
    Conflict,
    QuotaExceeded,
}

/// An active credential row.
pub struct StoredCredentials {
    pub id: Uuid,
    pub api_key_hash: String,
    pub secret: String,
}

pub struct ServerDatabase {
    pub pool: PgPool,
}

fn bind_record(
    query: Query<'_, Postgres, PgArguments>,
    params: RecordParams,
) -> Query<'_, Postgres, PgArguments> {
    query
        .bind(params.0)
        .bind(params.1)
        .bind(params.2)
        .bind(params.3)
        .bind(params.4)
        .bind(params.5)
        .bind(params.6)
        .bind(params.7)
        .bind(params.8)
        .bind(params.9)
        .bind(params.10)
        .bind(params.11)
        .bind(params.12)
}

/// PostgreSQL unique_violation, raised when two writers create the same record at once.
fn is_duplicate_key_error(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = e {
        return db_err.code().map(|c| c == "23505").unwrap_or(false);
    }
    false
}

impl ServerDatabase {
    pub async fn new(database_url: &str) -> SyncResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> SyncResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn fetch_record(&self, owner: &str, id: &Uuid) -> SyncResult<Option<TodoRecord>> {
        let row = sqlx::query(Queries::GET_RECORD)
            .bind(owner)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(parse_record).transpose()
    }

    /// Write `record` for `owner` if the stored change tag still equals `expected_tag`.
    ///
    /// `None` means the writer believes the record does not exist yet. The stored owner is
    /// always `owner`, whatever the record carries.
    pub async fn save_record(
        &self,
        owner: &str,
        record: &TodoRecord,
        expected_tag: Option<&str>,
        quota: Option<i64>,
    ) -> SyncResult<SaveOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(Queries::GET_RECORD_FOR_UPDATE)
            .bind(owner)
            .bind(record.id)
            .fetch_optional(&mut *tx)
            .await?;
        let current_tag: Option<String> = existing
            .as_ref()
            .map(|row| row.try_get("change_tag"))
            .transpose()?;

        if current_tag.as_deref() != expected_tag {
            tracing::debug!(
                "DATABASE: Change tag mismatch for {} (stored {:?}, expected {:?})",
                record.id,
                current_tag,
                expected_tag
            );
            return Ok(SaveOutcome::Conflict);
        }

        if existing.is_none() {
            if let Some(quota) = quota {
                let count: i64 = sqlx::query(Queries::COUNT_RECORDS)
                    .bind(owner)
                    .fetch_one(&mut *tx)
                    .await?
                    .try_get("count")?;
                if count >= quota {
                    return Ok(SaveOutcome::QuotaExceeded);
                }
            }
        }

        let mut stored = record.clone();
        stored.owner_identity = owner.to_string();
        stored.change_tag = None;
        let change_tag = calculate_change_tag(&stored);

        let statement = if existing.is_some() {
            Queries::UPDATE_RECORD
        } else {
            Queries::INSERT_RECORD
        };
        let params = record_to_params(&stored, change_tag.clone());
        match bind_record(sqlx::query(statement), params)
            .execute(&mut *tx)
            .await
        {
            Ok(_) => {}
            Err(e) if is_duplicate_key_error(&e) => {
                tracing::debug!("DATABASE: Concurrent create of {}", record.id);
                return Ok(SaveOutcome::Conflict);
            }
            Err(e) => return Err(SyncError::Database(e)),
        }

        tx.commit().await?;
        stored.change_tag = Some(change_tag);
        Ok(SaveOutcome::Saved(stored))
    }

    /// Every record of `owner`, newest first.
    pub async fn query_records(&self, owner: &str) -> SyncResult<Vec<TodoRecord>> {
        let rows = sqlx::query(Queries::QUERY_RECORDS)
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(parse_record).collect()
    }

    /// Returns whether the record existed.
    pub async fn delete_record(&self, owner: &str, id: &Uuid) -> SyncResult<bool> {
        let result = sqlx::query(Queries::DELETE_RECORD)
            .bind(owner)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_records(&self, owner: &str) -> SyncResult<i64> {
        let row = sqlx::query(Queries::COUNT_RECORDS)
            .bind(owner)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("count")?)
    }

    pub async fn insert_credentials(
        &self,
        api_key_hash: &str,
        secret: &str,
        name: &str,
    ) -> SyncResult<Uuid> {
        let row = sqlx::query(Queries::INSERT_CREDENTIALS)
            .bind(api_key_hash)
            .bind(secret)
            .bind(name)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("id")?)
    }

    pub async fn active_credentials(&self) -> SyncResult<Vec<StoredCredentials>> {
        let rows = sqlx::query(Queries::GET_ACTIVE_CREDENTIALS)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> SyncResult<StoredCredentials> {
                Ok(StoredCredentials {
                    id: row.try_get("id")?,
                    api_key_hash: row.try_get("api_key_hash")?,
                    secret: row.try_get("secret")?,
                })
            })
            .collect()
    }

    pub async fn touch_credentials(&self, id: &Uuid) -> SyncResult<()> {
        sqlx::query(Queries::TOUCH_CREDENTIALS)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn deactivate_credentials(&self, id: &Uuid) -> SyncResult<bool> {
        let result = sqlx::query(Queries::DEACTIVATE_CREDENTIALS)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
