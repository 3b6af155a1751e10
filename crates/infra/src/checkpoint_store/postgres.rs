//! Postgres-backed checkpoint store.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS <schema>.job_checkpoints (
//!     job_id        TEXT        NOT NULL,
//!     checkpoint_id BIGINT      NOT NULL CHECK (checkpoint_id > 0),
//!     state_blob    BYTEA       NOT NULL,
//!     metadata      JSONB       NOT NULL,
//!     written_at    TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (job_id, checkpoint_id)
//! );
//! ```
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | CheckpointStoreError |
//! |------------|----------------------|----------------------|
//! | Database (unique violation) | `23505` | `Concurrency` |
//! | Database (other) | any other | `Query` |
//! | PoolTimedOut / PoolClosed / Io / Tls | N/A | `Connection` |
//! | ColumnDecode / Decode / ColumnNotFound | N/A | `Serialization` |
//! | Other | N/A | `Query` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use agentexec_core::JobId;

use super::r#trait::{
    TERMINAL_KIND, CheckpointRecord, CheckpointStore, CheckpointStoreError, NewCheckpoint,
};
use crate::config::PostgresConfig;

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: Arc<PgPool>,
    table: String,
}

impl PostgresCheckpointStore {
    /// `schema` must already be a validated SQL identifier (see `PipelineConfig`).
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool: Arc::new(pool),
            table: format!("{schema}.job_checkpoints"),
        }
    }

    /// Open a pool from config.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, CheckpointStoreError> {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .database(&config.database);
        if let Some(password) = &config.password {
            options = options.password(password);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self::new(pool, &config.schema))
    }

    /// Create the checkpoint table if missing.
    pub async fn ensure_schema(&self) -> Result<(), CheckpointStoreError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                job_id        TEXT        NOT NULL,
                checkpoint_id BIGINT      NOT NULL CHECK (checkpoint_id > 0),
                state_blob    BYTEA       NOT NULL,
                metadata      JSONB       NOT NULL,
                written_at    TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (job_id, checkpoint_id)
            )
            "#,
            table = self.table
        );
        sqlx::query(&ddl)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    /// Append inside a transaction: read `MAX(checkpoint_id)`, insert `max + 1`.
    ///
    /// A concurrent writer racing for the same id hits the primary key and
    /// surfaces as `Concurrency`.
    #[instrument(skip(self, checkpoint), fields(job_id = %checkpoint.job_id), err)]
    async fn append(&self, checkpoint: NewCheckpoint) -> Result<CheckpointRecord, CheckpointStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current: i64 = sqlx::query_scalar(&format!(
            "SELECT COALESCE(MAX(checkpoint_id), 0) FROM {} WHERE job_id = $1",
            self.table
        ))
        .bind(checkpoint.job_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("current_checkpoint", e))?;

        let written_at = Utc::now();
        let checkpoint_id = current + 1;

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (job_id, checkpoint_id, state_blob, metadata, written_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
            self.table
        ))
        .bind(checkpoint.job_id.as_str())
        .bind(checkpoint_id)
        .bind(&checkpoint.state_blob)
        .bind(&checkpoint.metadata)
        .bind(written_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_checkpoint", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(CheckpointRecord {
            job_id: checkpoint.job_id,
            checkpoint_id: checkpoint_id as u64,
            state_blob: checkpoint.state_blob,
            metadata: checkpoint.metadata,
            written_at,
        })
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn list(&self, job_id: &JobId) -> Result<Vec<CheckpointRecord>, CheckpointStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT job_id, checkpoint_id, state_blob, metadata, written_at
            FROM {}
            WHERE job_id = $1
            ORDER BY checkpoint_id ASC
            "#,
            self.table
        ))
        .bind(job_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_checkpoints", e))?;

        rows.iter().map(decode_row).collect()
    }

    async fn latest(&self, job_id: &JobId) -> Result<Option<CheckpointRecord>, CheckpointStoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT job_id, checkpoint_id, state_blob, metadata, written_at
            FROM {}
            WHERE job_id = $1
            ORDER BY checkpoint_id DESC
            LIMIT 1
            "#,
            self.table
        ))
        .bind(job_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_checkpoint", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    async fn find_terminal(
        &self,
        job_id: &JobId,
    ) -> Result<Option<CheckpointRecord>, CheckpointStoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT job_id, checkpoint_id, state_blob, metadata, written_at
            FROM {}
            WHERE job_id = $1 AND metadata->>'kind' = $2
            ORDER BY checkpoint_id DESC
            LIMIT 1
            "#,
            self.table
        ))
        .bind(job_id.as_str())
        .bind(TERMINAL_KIND)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_terminal", e))?;

        row.as_ref().map(decode_row).transpose()
    }
}

/// Row shape of `job_checkpoints`.
struct CheckpointRow {
    job_id: String,
    checkpoint_id: i64,
    state_blob: Vec<u8>,
    metadata: JsonValue,
    written_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for CheckpointRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            job_id: row.try_get("job_id")?,
            checkpoint_id: row.try_get("checkpoint_id")?,
            state_blob: row.try_get("state_blob")?,
            metadata: row.try_get("metadata")?,
            written_at: row.try_get("written_at")?,
        })
    }
}

impl TryFrom<CheckpointRow> for CheckpointRecord {
    type Error = CheckpointStoreError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        Ok(Self {
            job_id: JobId::new(row.job_id)
                .map_err(|e| CheckpointStoreError::Serialization(e.to_string()))?,
            checkpoint_id: row.checkpoint_id.max(0) as u64,
            state_blob: row.state_blob,
            metadata: row.metadata,
            written_at: row.written_at,
        })
    }
}

fn decode_row(row: &PgRow) -> Result<CheckpointRecord, CheckpointStoreError> {
    CheckpointRow::from_row(row)
        .map_err(|e| CheckpointStoreError::Serialization(format!("failed to decode checkpoint row: {e}")))?
        .try_into()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CheckpointStoreError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            CheckpointStoreError::Concurrency(format!("{operation}: {db}"))
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => CheckpointStoreError::Connection(format!("{operation}: {err}")),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_) => {
            CheckpointStoreError::Serialization(format!("{operation}: {err}"))
        }
        _ => CheckpointStoreError::Query(format!("{operation}: {err}")),
    }
}
