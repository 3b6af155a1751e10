use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CloudEvents spec version produced and accepted on every subject.
pub const SPEC_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("unsupported specversion: {0}")]
    UnsupportedVersion(String),

    #[error("invalid envelope data: {0}")]
    InvalidData(String),

    #[error("envelope serialization failed: {0}")]
    Serialization(String),
}

/// Structured event envelope (CloudEvents 1.0 JSON format).
///
/// This is the unit exchanged on both the inbound job stream and the outbound
/// status stream.
///
/// Notes:
/// - `specversion` is written in the standard CloudEvents spelling; the
///   snake-case `spec_version` is accepted on input.
/// - `subject` carries the job id for pipeline-produced events.
/// - `traceparent` is the W3C distributed tracing extension, passed through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "specversion", alias = "spec_version")]
    spec_version: String,

    #[serde(rename = "type")]
    event_type: String,

    source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,

    id: String,

    time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    datacontenttype: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    traceparent: Option<String>,

    data: T,
}

impl<T> Envelope<T> {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        id: impl Into<String>,
        data: T,
    ) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_string(),
            event_type: event_type.into(),
            source: source.into(),
            subject: None,
            id: id.into(),
            time: Utc::now(),
            datacontenttype: Some("application/json".to_string()),
            traceparent: None,
            data,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    pub fn with_traceparent(mut self, traceparent: Option<String>) -> Self {
        self.traceparent = traceparent;
        self
    }

    pub fn spec_version(&self) -> &str {
        &self.spec_version
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn traceparent(&self) -> Option<&str> {
        self.traceparent.as_deref()
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Serialization(e.to_string()))
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Parse an envelope and check its spec version.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        if envelope.spec_version != SPEC_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(envelope.spec_version));
        }

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as JsonValue};

    #[test]
    fn accepts_both_specversion_spellings() {
        let standard = json!({
            "specversion": "1.0",
            "type": "t",
            "source": "s",
            "id": "1",
            "time": "2024-01-01T00:00:00Z",
            "data": {}
        });
        let snake = json!({
            "spec_version": "1.0",
            "type": "t",
            "source": "s",
            "id": "1",
            "time": "2024-01-01T00:00:00Z",
            "data": {}
        });

        for raw in [standard, snake] {
            let bytes = serde_json::to_vec(&raw).unwrap();
            let env = Envelope::<JsonValue>::decode(&bytes).unwrap();
            assert_eq!(env.spec_version(), "1.0");
        }
    }

    #[test]
    fn rejects_other_spec_versions() {
        let raw = json!({
            "specversion": "0.3",
            "type": "t",
            "source": "s",
            "id": "1",
            "time": "2024-01-01T00:00:00Z",
            "data": {}
        });
        let bytes = serde_json::to_vec(&raw).unwrap();
        let err = Envelope::<JsonValue>::decode(&bytes).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnsupportedVersion(v) if v == "0.3"));
    }

    #[test]
    fn encodes_standard_field_names() {
        let env = Envelope::new("dev.test", "unit", "abc", json!({"k": 1})).with_subject("J1");
        let value: JsonValue = serde_json::from_slice(&env.encode().unwrap()).unwrap();

        assert_eq!(value["specversion"], "1.0");
        assert_eq!(value["type"], "dev.test");
        assert_eq!(value["subject"], "J1");
        assert!(value.get("traceparent").is_none());
    }
}
