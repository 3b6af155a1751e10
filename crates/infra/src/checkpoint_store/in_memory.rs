use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use agentexec_core::JobId;

use super::r#trait::{CheckpointRecord, CheckpointStore, CheckpointStoreError, NewCheckpoint};

/// In-memory checkpoint store.
///
/// Intended for tests/dev. `set_available(false)` makes every call fail with
/// `Connection`, to exercise the transient-error paths.
#[derive(Debug)]
pub struct InMemoryCheckpointStore {
    jobs: RwLock<HashMap<JobId, Vec<CheckpointRecord>>>,
    available: AtomicBool,
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CheckpointStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CheckpointStoreError::Connection("in-memory store offline".to_string()))
        }
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn append(&self, checkpoint: NewCheckpoint) -> Result<CheckpointRecord, CheckpointStoreError> {
        self.check_available()?;

        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| CheckpointStoreError::Connection("lock poisoned".to_string()))?;

        let records = jobs.entry(checkpoint.job_id.clone()).or_default();
        let next_id = records.last().map(|r| r.checkpoint_id).unwrap_or(0) + 1;

        let record = CheckpointRecord {
            job_id: checkpoint.job_id,
            checkpoint_id: next_id,
            state_blob: checkpoint.state_blob,
            metadata: checkpoint.metadata,
            written_at: Utc::now(),
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn list(&self, job_id: &JobId) -> Result<Vec<CheckpointRecord>, CheckpointStoreError> {
        self.check_available()?;

        let jobs = self
            .jobs
            .read()
            .map_err(|_| CheckpointStoreError::Connection("lock poisoned".to_string()))?;
        Ok(jobs.get(job_id).cloned().unwrap_or_default())
    }
}
