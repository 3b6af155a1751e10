//! Terminal result events.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use agentexec_core::{JobId, TraceId};

use crate::envelope::Envelope;

/// Prefix of the CloudEvent type for terminal results (`<prefix>.<status>`).
pub const RESULT_EVENT_TYPE_PREFIX: &str = "dev.my-platform.agent";

/// Namespace for deterministic result envelope ids.
const RESULT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_3c2e_8d4b_4f7a_9e0c_5b2d_7a61_c3f4);

/// Terminal status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Completed => "completed",
            ResultStatus::Failed => "failed",
        }
    }

    /// CloudEvent `type` for this status.
    pub fn event_type(&self) -> String {
        format!("{RESULT_EVENT_TYPE_PREFIX}.{}", self.as_str())
    }
}

impl core::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error description carried by a `failed` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultError {
    pub message: String,

    /// Error category (e.g. `timeout`, `workflow`).
    #[serde(rename = "type")]
    pub kind: String,
}

impl ResultError {
    pub fn new(message: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: kind.into(),
        }
    }
}

/// The `data` section of a result envelope.
///
/// Exactly one of `result` / `error` is set, matching `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultData {
    pub job_id: JobId,
    pub trace_id: TraceId,
    pub status: ResultStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultError>,
}

impl ResultData {
    pub fn completed(job_id: JobId, trace_id: TraceId, result: JsonValue) -> Self {
        Self {
            job_id,
            trace_id,
            status: ResultStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(job_id: JobId, trace_id: TraceId, error: ResultError) -> Self {
        Self {
            job_id,
            trace_id,
            status: ResultStatus::Failed,
            result: None,
            error: Some(error),
        }
    }

    /// Deterministic envelope id for this job's terminal event.
    ///
    /// Re-emitting the same outcome yields the same id, so the broker's
    /// message-id dedup window drops the copy.
    pub fn envelope_id(&self) -> Uuid {
        result_envelope_id(&self.job_id, self.status)
    }

    /// Wrap in a result envelope (`subject = job_id`).
    pub fn into_envelope(self, source: impl Into<String>) -> ResultEnvelope {
        let id = self.envelope_id().to_string();
        let subject = self.job_id.to_string();
        Envelope::new(self.status.event_type(), source, id, self).with_subject(subject)
    }
}

/// Envelope type published on the status stream.
pub type ResultEnvelope = Envelope<ResultData>;

pub fn result_envelope_id(job_id: &JobId, status: ResultStatus) -> Uuid {
    let name = format!("{}/{}", job_id.as_str(), status.as_str());
    Uuid::new_v5(&RESULT_ID_NAMESPACE, name.as_bytes())
}
