//! Progress publisher: best-effort fan-out of execution events.
//!
//! `emit` only enqueues. A background task hands queued events to the sink
//! one at a time, each bounded by `publish_timeout`. Sink errors, timeouts
//! and a full queue are logged and counted, then the event is dropped.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use agentexec_core::JobId;
use agentexec_events::{ProgressError, ProgressEvent, ProgressKind, ProgressSink};
use agentexec_observability::PipelineMetrics;

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisProgressSink;

#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Limit on one sink call
    pub publish_timeout: Duration,
    /// Events waiting for the sink before new ones are dropped
    pub buffer: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_millis(500),
            buffer: 1024,
        }
    }
}

impl ProgressConfig {
    pub fn with_publish_timeout(mut self, publish_timeout: Duration) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }
}

enum Command {
    Publish(ProgressEvent),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct ProgressPublisher {
    queue: mpsc::Sender<Command>,
    metrics: PipelineMetrics,
}

impl ProgressPublisher {
    /// Publisher with default settings. See [`ProgressPublisher::spawn`].
    pub fn new(sink: Arc<dyn ProgressSink>, metrics: PipelineMetrics) -> Self {
        Self::spawn(sink, metrics, ProgressConfig::default())
    }

    /// Start the delivery task; it runs until every clone is dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(sink: Arc<dyn ProgressSink>, metrics: PipelineMetrics, config: ProgressConfig) -> Self {
        let (queue, commands) = mpsc::channel(config.buffer.max(1));
        tokio::spawn(deliver(commands, sink, metrics.clone(), config.publish_timeout));
        Self { queue, metrics }
    }

    /// Queue one event without waiting for the sink.
    pub fn publish(&self, event: ProgressEvent) {
        let Err(error) = self.queue.try_send(Command::Publish(event)) else {
            return;
        };
        let reason = match &error {
            TrySendError::Full(_) => "queue full",
            TrySendError::Closed(_) => "publisher stopped",
        };
        if let Command::Publish(event) = error.into_inner() {
            self.metrics.progress_publish_failed();
            warn!(
                job_id = %event.job_id,
                event_type = event.kind.as_str(),
                sequence = event.sequence,
                reason,
                "progress event dropped"
            );
        }
    }

    /// Wait until every event queued before this call reached the sink or
    /// was given up on.
    pub async fn flush(&self) {
        let (done, flushed) = oneshot::channel();
        if self.queue.send(Command::Flush(done)).await.is_ok() {
            let _ = flushed.await;
        }
    }

    /// A per-execution handle that numbers events.
    pub fn for_job(&self, job_id: &JobId) -> JobProgress {
        JobProgress {
            publisher: self.clone(),
            job_id: job_id.clone(),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }
}

async fn deliver(
    mut commands: mpsc::Receiver<Command>,
    sink: Arc<dyn ProgressSink>,
    metrics: PipelineMetrics,
    publish_timeout: Duration,
) {
    while let Some(command) = commands.recv().await {
        let event = match command {
            Command::Publish(event) => event,
            Command::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        let result = match timeout(publish_timeout, sink.publish(&event)).await {
            Ok(result) => result,
            Err(_) => Err(ProgressError::Timeout),
        };

        match result {
            Ok(()) => metrics.progress_published(event.kind.as_str()),
            Err(error) => {
                metrics.progress_publish_failed();
                warn!(
                    job_id = %event.job_id,
                    event_type = event.kind.as_str(),
                    sequence = event.sequence,
                    %error,
                    "progress publish failed"
                );
            }
        }
    }
    debug!("progress delivery stopped");
}

/// Event sink handed to the execution coordinator for one job.
#[derive(Clone)]
pub struct JobProgress {
    publisher: ProgressPublisher,
    job_id: JobId,
    sequence: Arc<AtomicU64>,
}

impl JobProgress {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Number and queue one event. Never waits on the sink.
    pub fn emit(&self, kind: ProgressKind, payload: JsonValue) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.publisher
            .publish(ProgressEvent::new(self.job_id.clone(), kind, payload, sequence));
    }

    /// Number of events emitted so far.
    pub fn emitted(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}
