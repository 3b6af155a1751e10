//! Checkpoint store boundary.
//!
//! Checkpoints are keyed by `(job_id, checkpoint_id)` and owned by the
//! execution coordinator. The pipeline supplies the job id and guarantees a
//! single writer per job by handing out `CheckpointWriter`s only while the job's
//! execution guard is held.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod r#trait;

use std::sync::Arc;

use serde_json::{Value as JsonValue, json};

use agentexec_core::JobId;
use agentexec_events::ResultData;

pub use in_memory::InMemoryCheckpointStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresCheckpointStore;
pub use r#trait::{
    CheckpointRecord, CheckpointStore, CheckpointStoreError, NewCheckpoint, TERMINAL_KIND,
};

/// Job-scoped checkpoint handle given to the coordinator.
///
/// It can only read and write checkpoints of the job it was created for.
#[derive(Clone)]
pub struct CheckpointWriter {
    store: Arc<dyn CheckpointStore>,
    job_id: JobId,
}

impl CheckpointWriter {
    pub fn new(store: Arc<dyn CheckpointStore>, job_id: JobId) -> Self {
        Self { store, job_id }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub async fn write(
        &self,
        state_blob: Vec<u8>,
        metadata: JsonValue,
    ) -> Result<CheckpointRecord, CheckpointStoreError> {
        self.store
            .append(NewCheckpoint {
                job_id: self.job_id.clone(),
                state_blob,
                metadata,
            })
            .await
    }

    /// The newest checkpoint, for resuming a partially completed run.
    pub async fn latest(&self) -> Result<Option<CheckpointRecord>, CheckpointStoreError> {
        self.store.latest(&self.job_id).await
    }

    pub async fn history(&self) -> Result<Vec<CheckpointRecord>, CheckpointStoreError> {
        self.store.list(&self.job_id).await
    }

    /// Append the terminal marker carrying the job's final result.
    ///
    /// A redelivered job with a marker is answered from it instead of running
    /// again, whether it completed or failed.
    pub async fn record_terminal(
        &self,
        data: &ResultData,
    ) -> Result<CheckpointRecord, CheckpointStoreError> {
        let blob = serde_json::to_vec(data)
            .map_err(|e| CheckpointStoreError::Serialization(e.to_string()))?;
        self.write(
            blob,
            json!({
                "kind": TERMINAL_KIND,
                "status": data.status.as_str(),
                "trace_id": data.trace_id.as_str(),
            }),
        )
        .await
    }
}

/// Decode the result stored in a terminal marker.
pub fn terminal_result(record: &CheckpointRecord) -> Result<ResultData, CheckpointStoreError> {
    serde_json::from_slice(&record.state_blob)
        .map_err(|e| CheckpointStoreError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentexec_core::TraceId;
    use agentexec_events::ResultError;

    #[tokio::test]
    async fn writer_is_scoped_to_its_job() {
        let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
        let a = CheckpointWriter::new(store.clone(), JobId::new("A").unwrap());
        let b = CheckpointWriter::new(store.clone(), JobId::new("B").unwrap());

        a.write(b"1".to_vec(), json!({})).await.unwrap();
        a.write(b"2".to_vec(), json!({})).await.unwrap();
        b.write(b"x".to_vec(), json!({})).await.unwrap();

        assert_eq!(a.history().await.unwrap().len(), 2);
        assert_eq!(b.latest().await.unwrap().unwrap().state_blob, b"x".to_vec());
    }

    #[tokio::test]
    async fn terminal_marker_round_trips_result() {
        let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
        let job_id = JobId::new("J1").unwrap();
        let writer = CheckpointWriter::new(store.clone(), job_id.clone());

        let data = ResultData::completed(
            job_id.clone(),
            TraceId::new("T1").unwrap(),
            json!({"status": "completed", "output": "hi"}),
        );
        writer.record_terminal(&data).await.unwrap();

        let marker = store.find_terminal(&job_id).await.unwrap().unwrap();
        assert_eq!(marker.metadata["trace_id"], "T1");
        assert_eq!(marker.metadata["status"], "completed");
        assert_eq!(terminal_result(&marker).unwrap(), data);
    }

    #[tokio::test]
    async fn failed_outcome_is_recorded_as_terminal() {
        let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
        let job_id = JobId::new("J2").unwrap();
        let writer = CheckpointWriter::new(store.clone(), job_id.clone());

        writer.write(b"step".to_vec(), json!({"step": 1})).await.unwrap();
        let data = ResultData::failed(
            job_id.clone(),
            TraceId::new("T2").unwrap(),
            ResultError::new("tool crashed", "workflow"),
        );
        writer.record_terminal(&data).await.unwrap();

        let marker = store.find_terminal(&job_id).await.unwrap().unwrap();
        assert_eq!(marker.checkpoint_id, 2);
        assert_eq!(marker.metadata["status"], "failed");
        assert_eq!(terminal_result(&marker).unwrap().error, data.error);
    }
}
