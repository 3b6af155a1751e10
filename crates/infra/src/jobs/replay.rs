//! Replay coordinator.
//!
//! Runs a job by replaying progress events captured from a real workflow run,
//! with the recorded job id rewritten to the live one. It exercises every
//! pipeline side effect (progress fan-out, checkpoints, cancellation, retries)
//! without a model or tool backend, and is fully driven by an injected
//! `ReplayConfig`, so differently configured coordinators can run side by side.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tracing::{debug, instrument};

use agentexec_events::{JobRequest, ProgressKind};

use super::coordinator::{ExecutionContext, ExecutionCoordinator, ExecutionError};
use crate::config::ExecutionMode;

/// Metadata `kind` of checkpoints written by the replay coordinator.
pub const REPLAY_CHECKPOINT_KIND: &str = "replay";

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("cannot read replay events from {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("replay events file must contain a JSON array: {0}")]
    Parse(String),
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Captured events, replayed in order.
    pub events: Vec<JsonValue>,
    /// Pause between events.
    pub event_delay: Duration,
    /// Maximum number of checkpoints written per run.
    pub checkpoints: usize,
    /// Job id baked into the captured events, replaced by the live job id.
    pub recorded_job_id: Option<String>,
    /// Attempts `1..=fail_attempts` fail before replaying anything.
    pub fail_attempts: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            event_delay: Duration::from_millis(5),
            checkpoints: 3,
            recorded_job_id: None,
            fail_attempts: 0,
        }
    }
}

impl ReplayConfig {
    pub fn from_events(events: Vec<JsonValue>) -> Self {
        let recorded_job_id = events.iter().find_map(|e| {
            e.get("job_id")
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        });
        Self {
            events,
            recorded_job_id,
            ..Default::default()
        }
    }

    /// Load captured events from a JSON array file.
    pub fn load(path: &Path) -> Result<Self, ReplayError> {
        let raw = std::fs::read(path).map_err(|e| ReplayError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let events: Vec<JsonValue> =
            serde_json::from_slice(&raw).map_err(|e| ReplayError::Parse(e.to_string()))?;
        Ok(Self::from_events(events))
    }

    /// Build from the configured execution mode; `None` for non-replay modes.
    pub fn from_mode(mode: &ExecutionMode) -> Result<Option<Self>, ReplayError> {
        match mode {
            ExecutionMode::Replay {
                events_file,
                event_delay,
            } => {
                let config = match events_file {
                    Some(path) => Self::load(path)?,
                    None => Self::default(),
                };
                Ok(Some(config.with_event_delay(*event_delay)))
            }
            ExecutionMode::External => Ok(None),
        }
    }

    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: usize) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn with_recorded_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.recorded_job_id = Some(job_id.into());
        self
    }

    pub fn with_fail_attempts(mut self, attempts: u32) -> Self {
        self.fail_attempts = attempts;
        self
    }
}

pub struct ReplayCoordinator {
    config: ReplayConfig,
}

impl ReplayCoordinator {
    pub fn new(config: ReplayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    fn rewrite(&self, event: &JsonValue, live_job_id: &str) -> JsonValue {
        let mut event = event.clone();
        if let Some(recorded) = self.config.recorded_job_id.as_deref() {
            replace_job_id(&mut event, recorded, live_job_id);
        }
        event
    }

    fn checkpoint_interval(&self) -> Option<usize> {
        let total = self.config.events.len();
        if self.config.checkpoints == 0 || total == 0 {
            return None;
        }
        Some(total.div_ceil(self.config.checkpoints).max(1))
    }

    /// Where to pick up: the `events_replayed` of the latest replay checkpoint.
    async fn resume_point(&self, ctx: &ExecutionContext) -> Result<usize, ExecutionError> {
        let latest = ctx.checkpoints().latest().await?;
        Ok(latest
            .filter(|r| r.metadata.get("kind").and_then(JsonValue::as_str) == Some(REPLAY_CHECKPOINT_KIND))
            .and_then(|r| r.metadata.get("events_replayed").and_then(JsonValue::as_u64))
            .map(|n| (n as usize).min(self.config.events.len()))
            .unwrap_or(0))
    }
}

/// Swap `recorded` for `live` in every `job_id` field, at any depth. Other
/// values are left alone even when they contain the recorded id.
fn replace_job_id(value: &mut JsonValue, recorded: &str, live: &str) {
    match value {
        JsonValue::Object(fields) => {
            for (key, field) in fields.iter_mut() {
                if key == "job_id" && field.as_str() == Some(recorded) {
                    *field = JsonValue::String(live.to_string());
                } else {
                    replace_job_id(field, recorded, live);
                }
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                replace_job_id(item, recorded, live);
            }
        }
        _ => {}
    }
}

#[async_trait]
impl ExecutionCoordinator for ReplayCoordinator {
    #[instrument(skip_all, fields(job_id = %ctx.job_id(), attempt = ctx.attempt()))]
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        request: &JobRequest,
    ) -> Result<JsonValue, ExecutionError> {
        if ctx.attempt() <= self.config.fail_attempts {
            return Err(ExecutionError::Workflow(format!(
                "replay configured to fail attempt {}",
                ctx.attempt()
            )));
        }

        let total = self.config.events.len();
        let start = self.resume_point(ctx).await?;
        let interval = self.checkpoint_interval();
        if start > 0 {
            debug!(start, total, "resuming replay from checkpoint");
        }

        for (index, event) in self.config.events.iter().enumerate().skip(start) {
            if ctx.cancellation().is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            let payload = self.rewrite(event, ctx.job_id().as_str());
            ctx.progress().emit(ProgressKind::classify(event), payload);

            let replayed = index + 1;
            if let Some(interval) = interval {
                if replayed % interval == 0 || replayed == total {
                    let state = json!({"events_replayed": replayed});
                    ctx.checkpoints()
                        .write(
                            state.to_string().into_bytes(),
                            json!({"kind": REPLAY_CHECKPOINT_KIND, "events_replayed": replayed}),
                        )
                        .await?;
                }
            }

            if !self.config.event_delay.is_zero() {
                tokio::select! {
                    _ = ctx.cancellation().cancelled() => return Err(ExecutionError::Cancelled),
                    _ = tokio::time::sleep(self.config.event_delay) => {}
                }
            }
        }

        ctx.progress()
            .emit(ProgressKind::End, json!({"status": "completed", "events_replayed": total}));

        Ok(json!({
            "status": "completed",
            "output": format!("Replayed {total} events"),
            "final_state": {
                "definition": request.workflow_definition,
                "files": {},
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use agentexec_core::{JobId, TraceId};
    use agentexec_events::InMemoryProgressBus;
    use agentexec_observability::PipelineMetrics;
    use chrono::Utc;
    use prometheus::Registry;
    use tokio_util::sync::CancellationToken;

    use crate::checkpoint_store::{CheckpointStore, CheckpointWriter, InMemoryCheckpointStore};
    use crate::progress::ProgressPublisher;

    const RECORDED: &str = "recorded-job-1";

    fn captured(n: usize) -> Vec<JsonValue> {
        (0..n)
            .map(|i| {
                let kind = match i % 3 {
                    0 => "on_llm_stream",
                    1 => "on_tool_start",
                    _ => "on_tool_end",
                };
                json!({"type": kind, "job_id": RECORDED, "data": {"i": i}})
            })
            .collect()
    }

    fn request() -> JobRequest {
        JobRequest {
            job_id: JobId::new("live-1").unwrap(),
            trace_id: TraceId::new("T1").unwrap(),
            workflow_definition: json!({"name": "demo"}),
            input_payload: json!({"user_request": "hello"}),
            received_at: Utc::now(),
            traceparent: None,
        }
    }

    struct Harness {
        bus: Arc<InMemoryProgressBus>,
        store: Arc<InMemoryCheckpointStore>,
        publisher: ProgressPublisher,
    }

    impl Harness {
        fn new() -> Self {
            let bus = Arc::new(InMemoryProgressBus::new());
            let metrics = PipelineMetrics::new(Registry::new()).unwrap();
            Self {
                publisher: ProgressPublisher::new(bus.clone(), metrics),
                bus,
                store: Arc::new(InMemoryCheckpointStore::new()),
            }
        }

        fn ctx(&self, attempt: u32, cancel: CancellationToken) -> ExecutionContext {
            let req = request();
            ExecutionContext::new(
                req.job_id.clone(),
                req.trace_id.clone(),
                attempt,
                self.publisher.for_job(&req.job_id),
                CheckpointWriter::new(self.store.clone(), req.job_id.clone()),
                cancel,
            )
        }
    }

    #[tokio::test]
    async fn replays_events_under_the_live_job_id() {
        let h = Harness::new();
        let sub = h.bus.subscribe();
        let coordinator =
            ReplayCoordinator::new(ReplayConfig::from_events(captured(6)).with_event_delay(Duration::ZERO));

        let out = coordinator
            .execute(&h.ctx(1, CancellationToken::new()), &request())
            .await
            .unwrap();

        assert_eq!(out["status"], "completed");
        assert_eq!(out["final_state"]["definition"]["name"], "demo");

        h.publisher.flush().await;
        let events = sub.drain();
        assert_eq!(events.len(), 7);
        assert_eq!(events[0].kind, ProgressKind::LlmStream);
        assert_eq!(events[1].kind, ProgressKind::ToolStart);
        assert_eq!(events[6].kind, ProgressKind::End);
        assert_eq!(events[0].payload["job_id"], "live-1");
        assert!(events.iter().all(|e| e.job_id.as_str() == "live-1"));
    }

    #[tokio::test]
    async fn short_recorded_id_only_replaces_job_id_fields() {
        let h = Harness::new();
        let sub = h.bus.subscribe();
        let events = vec![json!({
            "type": "on_tool_end",
            "job_id": "1",
            "data": {"count": "1", "output": "step 1 of 10", "nested": [{"job_id": "1"}]},
        })];
        let coordinator = ReplayCoordinator::new(
            ReplayConfig::from_events(events).with_event_delay(Duration::ZERO),
        );

        coordinator
            .execute(&h.ctx(1, CancellationToken::new()), &request())
            .await
            .unwrap();
        h.publisher.flush().await;

        let events = sub.drain();
        let payload = &events[0].payload;
        assert_eq!(payload["job_id"], "live-1");
        assert_eq!(payload["data"]["count"], "1");
        assert_eq!(payload["data"]["output"], "step 1 of 10");
        assert_eq!(payload["data"]["nested"][0]["job_id"], "live-1");
    }

    #[tokio::test]
    async fn writes_at_most_the_configured_checkpoints() {
        let h = Harness::new();
        let coordinator =
            ReplayCoordinator::new(ReplayConfig::from_events(captured(10)).with_event_delay(Duration::ZERO));

        coordinator
            .execute(&h.ctx(1, CancellationToken::new()), &request())
            .await
            .unwrap();

        let written = h.store.list(&request().job_id).await.unwrap();
        let ids: Vec<u64> = written.iter().map(|r| r.checkpoint_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(written[2].metadata["events_replayed"], 10);
    }

    #[tokio::test]
    async fn resumes_after_latest_replay_checkpoint() {
        let h = Harness::new();
        let writer = CheckpointWriter::new(h.store.clone(), request().job_id);
        writer
            .write(vec![], json!({"kind": REPLAY_CHECKPOINT_KIND, "events_replayed": 4}))
            .await
            .unwrap();

        let sub = h.bus.subscribe();
        let coordinator =
            ReplayCoordinator::new(ReplayConfig::from_events(captured(6)).with_event_delay(Duration::ZERO));
        coordinator
            .execute(&h.ctx(2, CancellationToken::new()), &request())
            .await
            .unwrap();
        h.publisher.flush().await;

        // Two remaining events plus the end marker.
        assert_eq!(sub.drain().len(), 3);
    }

    #[tokio::test]
    async fn configured_failures_fail_early_attempts_only() {
        let h = Harness::new();
        let coordinator = ReplayCoordinator::new(
            ReplayConfig::from_events(captured(2))
                .with_event_delay(Duration::ZERO)
                .with_fail_attempts(2),
        );

        for attempt in 1..=2 {
            let err = coordinator
                .execute(&h.ctx(attempt, CancellationToken::new()), &request())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "workflow");
        }
        assert!(coordinator
            .execute(&h.ctx(3, CancellationToken::new()), &request())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn cancellation_stops_the_replay() {
        let h = Harness::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let coordinator = ReplayCoordinator::new(ReplayConfig::from_events(captured(3)));
        let err = coordinator
            .execute(&h.ctx(1, cancel), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
    }

    #[test]
    fn loads_events_file_and_detects_recorded_id() {
        let path = std::env::temp_dir().join(format!("replay-events-{}.json", uuid::Uuid::now_v7()));
        std::fs::write(&path, serde_json::to_vec(&captured(2)).unwrap()).unwrap();

        let config = ReplayConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.events.len(), 2);
        assert_eq!(config.recorded_job_id.as_deref(), Some(RECORDED));
    }

    #[test]
    fn missing_events_file_is_an_error() {
        let err = ReplayConfig::load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, ReplayError::Io { .. }));
    }

    #[test]
    fn external_mode_has_no_replay_config() {
        assert!(ReplayConfig::from_mode(&ExecutionMode::External).unwrap().is_none());
    }
}
