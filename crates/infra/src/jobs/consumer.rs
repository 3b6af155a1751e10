//! Job consumer: pulls job requests from the durable stream and drives them
//! through execution, retry and result emission.
//!
//! ## Acknowledgement rules
//!
//! - Malformed messages and duplicate deliveries are acked immediately
//! - A message is acked only after its terminal result was durably published
//! - Failed attempts below `retry.max_attempts` are nak'ed with backoff
//! - A result that cannot be published is nak'ed, never dropped
//!
//! The per-job `ExecutionGuard` is the only shared mutable state; no lock is
//! held across a broker, store or coordinator call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use agentexec_core::JobId;
use agentexec_events::{JobRequest, ResultData, ResultError, ResultStatus};
use agentexec_observability::PipelineMetrics;

use super::coordinator::{ExecutionContext, ExecutionCoordinator, ExecutionError};
use super::emitter::ResultEmitter;
use super::guard::{ExecutionGuard, GuardToken};
use super::types::RetryPolicy;
use crate::broker::{Delivery, JobSource};
use crate::checkpoint_store::{CheckpointRecord, CheckpointStore, CheckpointWriter, terminal_result};
use crate::progress::ProgressPublisher;

/// Job consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Durable consumer name, also used for logging
    pub name: String,
    /// Maximum concurrent executions
    pub max_in_flight: usize,
    /// Maximum messages per fetch
    pub batch_size: usize,
    /// Wall-clock limit of one execution attempt
    pub job_timeout: Duration,
    /// How long shutdown waits for in-flight executions
    pub shutdown_grace: Duration,
    /// Pause after an empty fetch
    pub poll_interval: Duration,
    /// Execution attempts per job and the backoff between them
    pub retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: "agent-executor-workers".to_string(),
            max_in_flight: 4,
            batch_size: 10,
            job_timeout: Duration::from_secs(480),
            shutdown_grace: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// What happened to one delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Completed result published, message acked.
    Completed { attempts: u32 },
    /// A terminal marker already existed; its result was re-emitted and the message acked.
    AlreadyFinished { status: ResultStatus },
    /// Attempt failed below the limit; message nak'ed for redelivery.
    Retrying { attempt: u32, delay: Duration },
    /// Attempts exhausted; failed result published, message acked.
    Failed { attempts: u32 },
    /// Another delivery of the job is executing; this copy was acked.
    Duplicate,
    /// Payload could not be decoded; acked.
    Malformed,
    /// The terminal marker lookup could not reach the checkpoint store; nak'ed.
    Deferred,
    /// The terminal result could not be published; nak'ed.
    PublishFailed,
    /// Execution was cancelled by shutdown; nak'ed for immediate redelivery.
    Interrupted,
}

/// Backoff for a failing broker fetch.
fn fetch_backoff() -> RetryPolicy {
    RetryPolicy::exponential(u32::MAX, Duration::from_millis(100), Duration::from_secs(5))
        .with_jitter(0.0)
}

pub struct JobConsumer {
    config: ConsumerConfig,
    source: Arc<dyn JobSource>,
    coordinator: Arc<dyn ExecutionCoordinator>,
    checkpoints: Arc<dyn CheckpointStore>,
    progress: ProgressPublisher,
    emitter: ResultEmitter,
    metrics: PipelineMetrics,
    guard: ExecutionGuard,
    running: AtomicBool,
    interrupt: CancellationToken,
}

impl JobConsumer {
    pub fn new(
        config: ConsumerConfig,
        source: Arc<dyn JobSource>,
        coordinator: Arc<dyn ExecutionCoordinator>,
        checkpoints: Arc<dyn CheckpointStore>,
        progress: ProgressPublisher,
        emitter: ResultEmitter,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            config,
            source,
            coordinator,
            checkpoints,
            progress,
            emitter,
            metrics,
            guard: ExecutionGuard::new(),
            running: AtomicBool::new(false),
            interrupt: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Liveness: the pull loop is running and the broker connection is open.
    pub fn health_check(&self) -> bool {
        self.is_running() && self.source.is_connected()
    }

    /// Run the pull loop until `shutdown` fires, then drain in-flight executions.
    ///
    /// Executions still running after `shutdown_grace` are cancelled and given
    /// one more grace period to hand their messages back.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight));
        let tracker = TaskTracker::new();
        let backoff = fetch_backoff();
        let mut fetch_failures = 0u32;

        self.running.store(true, Ordering::SeqCst);
        info!(
            consumer = %self.config.name,
            max_in_flight = self.config.max_in_flight,
            "job consumer started"
        );

        loop {
            let available = permits.available_permits();
            if available == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = permits.acquire() => continue,
                }
            }

            let fetched = tokio::select! {
                _ = shutdown.cancelled() => break,
                fetched = self.source.fetch(self.config.batch_size.min(available)) => fetched,
            };

            let batch = match fetched {
                Ok(batch) => {
                    fetch_failures = 0;
                    batch
                }
                Err(error) => {
                    fetch_failures = fetch_failures.saturating_add(1);
                    self.metrics.broker_connection_error();
                    let delay = backoff.delay_for_attempt(fetch_failures);
                    warn!(%error, attempt = fetch_failures, ?delay, "fetch failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => continue,
                }
            }

            for delivery in batch {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let consumer = Arc::clone(&self);
                tracker.spawn(async move {
                    consumer.process_message(delivery.as_ref()).await;
                    drop(permit);
                });
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracker.close();
        info!(in_flight = tracker.len(), "job consumer stopping");

        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
            warn!(in_flight = tracker.len(), "grace period expired, interrupting executions");
            self.interrupt.cancel();
            if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
                error!(in_flight = tracker.len(), "executions ignored interruption");
            }
        }
        if tokio::time::timeout(grace, self.progress.flush()).await.is_err() {
            warn!("progress events still queued at shutdown");
        }
        info!(consumer = %self.config.name, "job consumer stopped");
    }

    /// Handle one delivered message end to end.
    pub async fn process_message(&self, delivery: &dyn Delivery) -> Outcome {
        let request = match JobRequest::decode(delivery.payload()) {
            Ok(request) => request,
            Err(error) => {
                warn!(subject = delivery.subject(), %error, "dropping malformed job message");
                self.metrics.job_rejected("malformed");
                self.metrics.message_failed();
                self.ack(delivery, None).await;
                return Outcome::Malformed;
            }
        };

        let job_id = request.job_id.clone();
        let Some(token) = self.guard.try_acquire(&job_id) else {
            info!(%job_id, "job already executing, dropping duplicate delivery");
            self.metrics.duplicate_delivery();
            self.ack(delivery, Some(&job_id)).await;
            return Outcome::Duplicate;
        };

        let span = info_span!(
            "job",
            %job_id,
            trace_id = %request.trace_id,
            delivery = delivery.delivery_count()
        );
        self.process_guarded(delivery, &request, &token)
            .instrument(span)
            .await
    }

    async fn process_guarded(
        &self,
        delivery: &dyn Delivery,
        request: &JobRequest,
        token: &GuardToken,
    ) -> Outcome {
        match self.checkpoints.find_terminal(&request.job_id).await {
            Ok(Some(marker)) => {
                if let Some(outcome) = self.reemit_terminal(delivery, request, token, &marker).await {
                    return outcome;
                }
            }
            Ok(None) => {}
            Err(error) => {
                warn!(%error, "terminal marker lookup failed, deferring job");
                self.metrics.db_error();
                self.nak(delivery, self.config.retry.base_delay).await;
                return Outcome::Deferred;
            }
        }

        let attempt = token.begin_attempt(delivery.delivery_count());
        let ctx = ExecutionContext::new(
            request.job_id.clone(),
            request.trace_id.clone(),
            attempt,
            self.progress.for_job(&request.job_id),
            CheckpointWriter::new(self.checkpoints.clone(), request.job_id.clone()),
            self.interrupt.child_token(),
        );

        debug!(attempt, "executing job");
        self.metrics.execution_started();
        let started = Instant::now();
        let result = self.execute(&ctx, request).await;
        self.metrics.execution_finished();
        let elapsed = started.elapsed();

        match result {
            Ok(result) => self.complete(delivery, &ctx, request, token, result, elapsed).await,
            Err(error) => self.fail(delivery, &ctx, request, token, error, elapsed).await,
        }
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        request: &JobRequest,
    ) -> Result<serde_json::Value, ExecutionError> {
        let limit = self.config.job_timeout;
        match tokio::time::timeout(limit, self.coordinator.execute(ctx, request)).await {
            Ok(result) => result,
            Err(_) => {
                ctx.cancellation().cancel();
                Err(ExecutionError::Timeout(limit))
            }
        }
    }

    /// Re-publish the result stored in a terminal marker. `None` when the
    /// marker is unreadable and the job should run again.
    async fn reemit_terminal(
        &self,
        delivery: &dyn Delivery,
        request: &JobRequest,
        token: &GuardToken,
        marker: &CheckpointRecord,
    ) -> Option<Outcome> {
        let data = match terminal_result(marker) {
            Ok(data) => data,
            Err(error) => {
                warn!(%error, checkpoint_id = marker.checkpoint_id, "unreadable terminal marker, re-executing");
                return None;
            }
        };

        let status = data.status;
        info!(%status, "job already finished, re-emitting stored result");
        match self.emitter.publish(data, request.traceparent.as_deref()).await {
            Ok(_) => {
                match status {
                    ResultStatus::Completed => token.mark_completed(),
                    ResultStatus::Failed => token.mark_failed(),
                }
                self.ack(delivery, Some(&request.job_id)).await;
                self.metrics.message_processed();
                Some(Outcome::AlreadyFinished { status })
            }
            Err(error) => {
                error!(%error, "stored result could not be re-emitted");
                self.nak(delivery, self.config.retry.base_delay).await;
                Some(Outcome::PublishFailed)
            }
        }
    }

    /// Best-effort: without the marker a redelivery re-executes the job.
    async fn record_terminal(&self, ctx: &ExecutionContext, data: &ResultData) {
        if let Err(error) = ctx.checkpoints().record_terminal(data).await {
            warn!(%error, status = %data.status, "terminal marker not written");
            self.metrics.db_error();
        }
    }

    async fn complete(
        &self,
        delivery: &dyn Delivery,
        ctx: &ExecutionContext,
        request: &JobRequest,
        token: &GuardToken,
        result: serde_json::Value,
        elapsed: Duration,
    ) -> Outcome {
        let attempt = ctx.attempt();
        let data = ResultData::completed(request.job_id.clone(), request.trace_id.clone(), result);
        self.record_terminal(ctx, &data).await;

        match self.emitter.publish(data, request.traceparent.as_deref()).await {
            Ok(_) => {
                token.mark_completed();
                self.ack(delivery, Some(&request.job_id)).await;
                self.metrics.job_finished("completed", elapsed);
                self.metrics.message_processed();
                info!(attempt, elapsed_ms = elapsed.as_millis() as u64, "job completed");
                Outcome::Completed { attempts: attempt }
            }
            Err(error) => {
                error!(%error, "completed result not published, returning job to the stream");
                token.record_failure(error.to_string());
                self.nak(delivery, self.config.retry.delay_for_attempt(attempt)).await;
                Outcome::PublishFailed
            }
        }
    }

    async fn fail(
        &self,
        delivery: &dyn Delivery,
        ctx: &ExecutionContext,
        request: &JobRequest,
        token: &GuardToken,
        error: ExecutionError,
        elapsed: Duration,
    ) -> Outcome {
        let attempt = ctx.attempt();
        token.record_failure(error.to_string());

        if matches!(error, ExecutionError::Cancelled) && self.interrupt.is_cancelled() {
            info!(attempt, "execution interrupted by shutdown");
            self.nak(delivery, Duration::ZERO).await;
            return Outcome::Interrupted;
        }

        let max_attempts = self.config.retry.max_attempts;
        if self.config.retry.should_retry(attempt) {
            let delay = self.config.retry.delay_for_attempt(attempt);
            warn!(attempt, max_attempts, ?delay, %error, "job attempt failed, will retry");
            self.metrics.job_retried();
            self.nak(delivery, delay).await;
            return Outcome::Retrying { attempt, delay };
        }

        error!(attempt, max_attempts, %error, "job failed permanently");
        let data = ResultData::failed(
            request.job_id.clone(),
            request.trace_id.clone(),
            ResultError::new(error.to_string(), error.kind()),
        );
        self.record_terminal(ctx, &data).await;

        match self.emitter.publish(data, request.traceparent.as_deref()).await {
            Ok(_) => {
                token.mark_failed();
                self.ack(delivery, Some(&request.job_id)).await;
                self.metrics.job_finished("failed", elapsed);
                self.metrics.message_failed();
                Outcome::Failed { attempts: attempt }
            }
            Err(publish_error) => {
                error!(error = %publish_error, "failed result not published, returning job to the stream");
                self.nak(delivery, self.config.retry.delay_for_attempt(attempt)).await;
                Outcome::PublishFailed
            }
        }
    }

    async fn ack(&self, delivery: &dyn Delivery, job_id: Option<&JobId>) {
        if let Err(error) = delivery.ack().await {
            warn!(job_id = ?job_id.map(JobId::as_str), subject = delivery.subject(), %error, "ack failed");
        }
    }

    async fn nak(&self, delivery: &dyn Delivery, delay: Duration) {
        if let Err(error) = delivery.nak(delay).await {
            warn!(subject = delivery.subject(), ?delay, %error, "nak failed");
        }
    }
}
