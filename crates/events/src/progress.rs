//! Live progress events and the sink abstraction executions push them into.
//!
//! Progress is best-effort: a missed subscriber loses events, and a failing
//! sink must never fail the execution that produced them. Sinks report errors
//! so callers can log and count them; they do not retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use agentexec_core::JobId;

/// Default channel prefix; the per-job channel is `<prefix>:<job_id>`.
pub const DEFAULT_CHANNEL_PREFIX: &str = "langgraph:stream";

/// Kind of progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    LlmStream,
    ToolStart,
    ToolEnd,
    End,
    Unknown,
}

impl ProgressKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressKind::LlmStream => "llm_stream",
            ProgressKind::ToolStart => "tool_start",
            ProgressKind::ToolEnd => "tool_end",
            ProgressKind::End => "end",
            ProgressKind::Unknown => "unknown",
        }
    }

    /// Map a callback/event label onto a kind.
    ///
    /// Accepts both the plain names and the `on_*` callback names emitted by
    /// agent frameworks. Anything else is `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label {
            "llm_stream" | "on_llm_stream" | "on_chat_model_stream" => ProgressKind::LlmStream,
            "tool_start" | "on_tool_start" => ProgressKind::ToolStart,
            "tool_end" | "on_tool_end" => ProgressKind::ToolEnd,
            "end" | "on_end" => ProgressKind::End,
            _ => ProgressKind::Unknown,
        }
    }

    /// Classify a captured event by its `type` (or `event`) field.
    pub fn classify(event: &JsonValue) -> Self {
        event
            .get("type")
            .or_else(|| event.get("event"))
            .and_then(JsonValue::as_str)
            .map(Self::from_label)
            .unwrap_or(ProgressKind::Unknown)
    }
}

/// One progress event. Ephemeral; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub job_id: JobId,
    pub payload: JsonValue,

    /// Per-execution sequence number, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(job_id: JobId, kind: ProgressKind, payload: JsonValue, sequence: u64) -> Self {
        Self {
            kind,
            job_id,
            payload,
            sequence,
            timestamp: Utc::now(),
        }
    }
}

/// Deterministic channel name for a job's progress.
pub fn progress_channel(prefix: &str, job_id: &JobId) -> String {
    format!("{prefix}:{}", job_id.as_str())
}

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("progress channel unavailable: {0}")]
    Unavailable(String),

    #[error("progress serialization failed: {0}")]
    Serialization(String),

    #[error("progress publish timed out")]
    Timeout,
}

/// Destination for progress events (pub/sub bus, in-memory bus, ...).
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, event: &ProgressEvent) -> Result<(), ProgressError>;
}

#[async_trait]
impl<S> ProgressSink for std::sync::Arc<S>
where
    S: ProgressSink + ?Sized,
{
    async fn publish(&self, event: &ProgressEvent) -> Result<(), ProgressError> {
        (**self).publish(event).await
    }
}
