use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use agentexec_core::JobId;

/// Metadata `kind` of the checkpoint holding a job's terminal result.
pub const TERMINAL_KIND: &str = "terminal";

/// A checkpoint ready to be appended (not yet assigned an id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCheckpoint {
    pub job_id: JobId,
    pub state_blob: Vec<u8>,
    pub metadata: JsonValue,
}

/// A persisted execution snapshot.
///
/// `checkpoint_id` is monotonically increasing per job, starting at 1. The
/// blob is opaque to the pipeline; only the coordinator interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub job_id: JobId,
    pub checkpoint_id: u64,
    pub state_blob: Vec<u8>,
    pub metadata: JsonValue,
    pub written_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn is_terminal(&self) -> bool {
        self.metadata.get("kind").and_then(JsonValue::as_str) == Some(TERMINAL_KIND)
    }
}

/// Checkpoint store error.
///
/// - `Concurrency`: another writer appended the same checkpoint id
/// - `Connection`: the store is unreachable (transient)
/// - `Serialization`: a stored record could not be decoded
#[derive(Debug, Error)]
pub enum CheckpointStoreError {
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error("checkpoint store unavailable: {0}")]
    Connection(String),

    #[error("checkpoint serialization failed: {0}")]
    Serialization(String),

    #[error("checkpoint store query failed: {0}")]
    Query(String),
}

/// Durable keyed storage of execution snapshots.
///
/// Appends for one job are serialised by the job consumer's execution guard;
/// implementations still reject conflicting ids rather than overwrite.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint, assigning `checkpoint_id = latest + 1`.
    async fn append(&self, checkpoint: NewCheckpoint) -> Result<CheckpointRecord, CheckpointStoreError>;

    /// All checkpoints for a job, ordered by `checkpoint_id`.
    async fn list(&self, job_id: &JobId) -> Result<Vec<CheckpointRecord>, CheckpointStoreError>;

    async fn latest(&self, job_id: &JobId) -> Result<Option<CheckpointRecord>, CheckpointStoreError> {
        Ok(self.list(job_id).await?.pop())
    }

    /// The terminal marker for a job, if the job already completed or failed.
    async fn find_terminal(
        &self,
        job_id: &JobId,
    ) -> Result<Option<CheckpointRecord>, CheckpointStoreError> {
        Ok(self
            .list(job_id)
            .await?
            .into_iter()
            .rev()
            .find(CheckpointRecord::is_terminal))
    }
}

#[async_trait]
impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    async fn append(&self, checkpoint: NewCheckpoint) -> Result<CheckpointRecord, CheckpointStoreError> {
        (**self).append(checkpoint).await
    }

    async fn list(&self, job_id: &JobId) -> Result<Vec<CheckpointRecord>, CheckpointStoreError> {
        (**self).list(job_id).await
    }

    async fn latest(&self, job_id: &JobId) -> Result<Option<CheckpointRecord>, CheckpointStoreError> {
        (**self).latest(job_id).await
    }

    async fn find_terminal(
        &self,
        job_id: &JobId,
    ) -> Result<Option<CheckpointRecord>, CheckpointStoreError> {
        (**self).find_terminal(job_id).await
    }
}
