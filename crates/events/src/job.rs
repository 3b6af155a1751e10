//! Inbound job requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use agentexec_core::{JobId, TraceId};

use crate::envelope::{Envelope, EnvelopeError};

/// CloudEvent type published by upstream producers for new jobs.
pub const JOB_REQUEST_EVENT_TYPE: &str = "dev.my-platform.agent.execute";

/// Wire shape of the inbound envelope's `data` section.
///
/// Producers historically sent the workflow under `agent_definition`; both
/// spellings are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequestData {
    pub job_id: JobId,
    pub trace_id: TraceId,
    #[serde(alias = "agent_definition")]
    pub workflow_definition: JsonValue,
    pub input_payload: JsonValue,
}

/// A job request, immutable once received. Identity is `job_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    pub trace_id: TraceId,
    pub workflow_definition: JsonValue,
    pub input_payload: JsonValue,
    pub received_at: DateTime<Utc>,

    /// W3C trace context from the inbound envelope, copied onto the result envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
}

impl JobRequest {
    /// Parse a raw broker payload into a validated request.
    ///
    /// Every failure here is permanent: retrying the same bytes cannot succeed.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope = Envelope::<JobRequestData>::decode(bytes)?;
        Self::from_envelope(envelope, Utc::now())
    }

    pub fn from_envelope(
        envelope: Envelope<JobRequestData>,
        received_at: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError> {
        let traceparent = envelope.traceparent().map(str::to_string);
        let data = envelope.into_data();

        if !data.workflow_definition.is_object() {
            return Err(EnvelopeError::InvalidData(
                "workflow_definition must be an object".to_string(),
            ));
        }
        if data.input_payload.is_null() {
            return Err(EnvelopeError::InvalidData(
                "input_payload is required".to_string(),
            ));
        }

        Ok(Self {
            job_id: data.job_id,
            trace_id: data.trace_id,
            workflow_definition: data.workflow_definition,
            input_payload: data.input_payload,
            received_at,
            traceparent,
        })
    }

    /// Build the inbound envelope for this request (producers and tests).
    pub fn to_envelope(&self, source: impl Into<String>, id: impl Into<String>) -> Envelope<JobRequestData> {
        Envelope::new(
            JOB_REQUEST_EVENT_TYPE,
            source,
            id,
            JobRequestData {
                job_id: self.job_id.clone(),
                trace_id: self.trace_id.clone(),
                workflow_definition: self.workflow_definition.clone(),
                input_payload: self.input_payload.clone(),
            },
        )
        .with_subject(self.job_id.as_str())
        .with_traceparent(self.traceparent.clone())
    }
}
