//! Shared fixtures for pipeline tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use prometheus::Registry;
use serde_json::{Value as JsonValue, json};

use agentexec_core::{JobId, TraceId};
use agentexec_events::{InMemoryProgressBus, JobRequest, ProgressKind};
use agentexec_observability::PipelineMetrics;

use super::consumer::{ConsumerConfig, JobConsumer};
use super::coordinator::{ExecutionContext, ExecutionCoordinator, ExecutionError};
use super::emitter::{EmitterConfig, ResultEmitter};
use super::types::RetryPolicy;
use crate::broker::InMemoryBroker;
use crate::checkpoint_store::InMemoryCheckpointStore;
use crate::progress::ProgressPublisher;

pub const JOB_SUBJECT: &str = "agent.execute.run";

/// Coordinator that fails its first `fail_first` calls, optionally sleeping
/// (cancellation-aware) before answering.
pub struct ScriptedCoordinator {
    fail_first: u32,
    delay: Duration,
    calls: AtomicU32,
}

impl ScriptedCoordinator {
    pub fn succeeding() -> Self {
        Self::failing(0)
    }

    pub fn failing(fail_first: u32) -> Self {
        Self {
            fail_first,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionCoordinator for ScriptedCoordinator {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        request: &JobRequest,
    ) -> Result<JsonValue, ExecutionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.progress()
            .emit(ProgressKind::ToolStart, json!({"tool": "search", "call": call}));

        if !self.delay.is_zero() {
            tokio::select! {
                _ = ctx.cancellation().cancelled() => return Err(ExecutionError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        if call <= self.fail_first {
            return Err(ExecutionError::Workflow(format!("tool crashed on call {call}")));
        }

        ctx.progress().emit(ProgressKind::End, json!({}));
        Ok(json!({
            "status": "completed",
            "output": format!("answered {}", request.input_payload["user_request"]),
        }))
    }
}

pub fn job_message(job_id: &str) -> Vec<u8> {
    let request = JobRequest {
        job_id: JobId::new(job_id).unwrap(),
        trace_id: TraceId::new(format!("trace-{job_id}")).unwrap(),
        workflow_definition: json!({"name": "demo", "nodes": []}),
        input_payload: json!({"user_request": "hello"}),
        received_at: Utc::now(),
        traceparent: None,
    };
    request
        .to_envelope("test-producer", format!("evt-{job_id}"))
        .encode()
        .unwrap()
}

/// A consumer wired entirely to in-memory components.
pub struct Pipeline {
    pub broker: InMemoryBroker,
    pub bus: Arc<InMemoryProgressBus>,
    pub store: Arc<InMemoryCheckpointStore>,
    pub metrics: PipelineMetrics,
    pub progress: ProgressPublisher,
    pub coordinator: Arc<ScriptedCoordinator>,
    pub consumer: Arc<JobConsumer>,
}

impl Pipeline {
    pub fn new(coordinator: ScriptedCoordinator, max_attempts: u32) -> Self {
        Self::with_config(
            coordinator,
            ConsumerConfig::default()
                .with_retry(RetryPolicy::fixed(max_attempts, Duration::from_millis(1)))
                .with_poll_interval(Duration::from_millis(5)),
        )
    }

    pub fn with_config(coordinator: ScriptedCoordinator, config: ConsumerConfig) -> Self {
        let broker = InMemoryBroker::new();
        let bus = Arc::new(InMemoryProgressBus::new());
        let store = Arc::new(InMemoryCheckpointStore::new());
        let metrics = PipelineMetrics::new(Registry::new()).unwrap();
        let coordinator = Arc::new(coordinator);
        let progress = ProgressPublisher::new(bus.clone(), metrics.clone());

        let emitter = ResultEmitter::new(
            Arc::new(broker.clone()),
            EmitterConfig::default().with_retry(RetryPolicy::fixed(2, Duration::from_millis(1))),
            metrics.clone(),
        );
        let consumer = Arc::new(JobConsumer::new(
            config,
            Arc::new(broker.clone()),
            coordinator.clone(),
            store.clone(),
            progress.clone(),
            emitter,
            metrics.clone(),
        ));

        Self {
            broker,
            bus,
            store,
            metrics,
            progress,
            coordinator,
            consumer,
        }
    }

    /// Fetch and process every queued message, redeliveries included.
    pub async fn drain(&self) -> Vec<super::consumer::Outcome> {
        use crate::broker::JobSource;

        let mut outcomes = Vec::new();
        loop {
            let batch = self.broker.fetch(16).await.unwrap();
            if batch.is_empty() {
                return outcomes;
            }
            for delivery in batch {
                outcomes.push(self.consumer.process_message(delivery.as_ref()).await);
            }
        }
    }
}
