//! Execution coordinator boundary.
//!
//! The pipeline hands a job to a coordinator and treats the call as atomic:
//! it returns once with a result or once with an `ExecutionError`. How the
//! workflow is compiled and run is entirely the coordinator's business.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use agentexec_core::{JobId, TraceId};
use agentexec_events::JobRequest;

use crate::checkpoint_store::{CheckpointStoreError, CheckpointWriter};
use crate::progress::JobProgress;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("workflow failed: {0}")]
    Workflow(String),

    #[error("execution exceeded {0:?}")]
    Timeout(Duration),

    #[error("execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Checkpoint(#[from] CheckpointStoreError),
}

impl ExecutionError {
    /// Short category used as the `type` of a failed result.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::InvalidDefinition(_) => "invalid_definition",
            ExecutionError::Workflow(_) => "workflow",
            ExecutionError::Timeout(_) => "timeout",
            ExecutionError::Cancelled => "cancelled",
            ExecutionError::Checkpoint(_) => "checkpoint",
        }
    }
}

/// Everything a coordinator may touch for one execution.
pub struct ExecutionContext {
    job_id: JobId,
    trace_id: TraceId,
    attempt: u32,
    progress: JobProgress,
    checkpoints: CheckpointWriter,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        job_id: JobId,
        trace_id: TraceId,
        attempt: u32,
        progress: JobProgress,
        checkpoints: CheckpointWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            trace_id,
            attempt,
            progress,
            checkpoints,
            cancel,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    /// 1-based attempt number of this execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn progress(&self) -> &JobProgress {
        &self.progress
    }

    pub fn checkpoints(&self) -> &CheckpointWriter {
        &self.checkpoints
    }

    /// Fires on timeout or process shutdown; long-running work should stop.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[async_trait]
pub trait ExecutionCoordinator: Send + Sync {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        request: &JobRequest,
    ) -> Result<JsonValue, ExecutionError>;
}

#[async_trait]
impl<C> ExecutionCoordinator for std::sync::Arc<C>
where
    C: ExecutionCoordinator + ?Sized,
{
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        request: &JobRequest,
    ) -> Result<JsonValue, ExecutionError> {
        (**self).execute(ctx, request).await
    }
}
