//! Result emitter: durable publication of terminal job results.
//!
//! Results go to `{subject_prefix}.{status}` with the deterministic envelope
//! id as broker message id, so a re-emitted result is dropped by the status
//! stream's dedup window instead of reaching subscribers twice.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use agentexec_events::{EnvelopeError, ResultData};
use agentexec_observability::PipelineMetrics;

use super::types::RetryPolicy;
use crate::broker::{BrokerError, PublishReceipt, StatusTransport};

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// `source` attribute of result envelopes.
    pub source: String,
    pub subject_prefix: String,
    /// Publish attempts before giving up (`max_attempts` counts them all).
    pub retry: RetryPolicy,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            source: "agent-executor".to_string(),
            subject_prefix: "agent.status".to_string(),
            retry: RetryPolicy::exponential(3, Duration::from_millis(200), Duration::from_secs(5)),
        }
    }
}

impl EmitterConfig {
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subject_prefix = prefix.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("result could not be encoded: {0}")]
    Encode(#[from] EnvelopeError),

    #[error("result publish failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: BrokerError },
}

#[derive(Clone)]
pub struct ResultEmitter {
    transport: Arc<dyn StatusTransport>,
    config: EmitterConfig,
    metrics: PipelineMetrics,
}

impl ResultEmitter {
    pub fn new(
        transport: Arc<dyn StatusTransport>,
        config: EmitterConfig,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            transport,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.config
    }

    /// Subject a result with this data is published to.
    pub fn subject_for(&self, data: &ResultData) -> String {
        format!("{}.{}", self.config.subject_prefix, data.status.as_str())
    }

    /// Publish one terminal result, retrying transient broker failures.
    ///
    /// `traceparent` is the job request's trace context, carried over so the
    /// result joins the caller's trace. Returns only once the broker confirmed
    /// persistence (or recognised a duplicate of an earlier copy).
    pub async fn publish(
        &self,
        data: ResultData,
        traceparent: Option<&str>,
    ) -> Result<PublishReceipt, EmitError> {
        let subject = self.subject_for(&data);
        let job_id = data.job_id.clone();
        let envelope = data
            .into_envelope(self.config.source.clone())
            .with_traceparent(traceparent.map(str::to_string));
        let msg_id = envelope.id().to_string();
        let payload = envelope.encode()?;

        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .transport
                .publish(&subject, &msg_id, payload.clone())
                .await
            {
                Ok(receipt) => {
                    debug!(
                        %job_id,
                        %subject,
                        sequence = receipt.sequence,
                        duplicate = receipt.duplicate,
                        "result published"
                    );
                    return Ok(receipt);
                }
                Err(error) => {
                    self.metrics.result_publish_failed();
                    warn!(%job_id, %subject, attempt, %error, "result publish failed");
                    if attempt >= max_attempts {
                        return Err(EmitError::Exhausted {
                            attempts: attempt,
                            last_error: error,
                        });
                    }
                    tokio::time::sleep(self.config.retry.delay_for_attempt(attempt)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentexec_core::{JobId, TraceId};
    use agentexec_events::{ResultError, ResultStatus};
    use prometheus::Registry;
    use serde_json::json;

    use crate::broker::InMemoryBroker;

    fn emitter(broker: &InMemoryBroker, metrics: PipelineMetrics) -> ResultEmitter {
        let config = EmitterConfig::default()
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(1)));
        ResultEmitter::new(Arc::new(broker.clone()), config, metrics)
    }

    fn completed() -> ResultData {
        ResultData::completed(
            JobId::new("J1").unwrap(),
            TraceId::new("T1").unwrap(),
            json!({"status": "completed"}),
        )
    }

    #[tokio::test]
    async fn publishes_to_status_subject() {
        let broker = InMemoryBroker::new();
        let metrics = PipelineMetrics::new(Registry::new()).unwrap();
        emitter(&broker, metrics)
            .publish(
                ResultData::failed(
                    JobId::new("J2").unwrap(),
                    TraceId::new("T2").unwrap(),
                    ResultError::new("boom", "workflow"),
                ),
                None,
            )
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].subject, "agent.status.failed");

        let envelope = &broker.published_results()[0];
        assert_eq!(envelope.event_type(), "dev.my-platform.agent.failed");
        assert_eq!(envelope.source(), "agent-executor");
        assert_eq!(envelope.subject(), Some("J2"));
        assert_eq!(envelope.id(), published[0].msg_id);
        assert_eq!(envelope.data().status, ResultStatus::Failed);
        assert!(envelope.traceparent().is_none());
    }

    #[tokio::test]
    async fn forwards_the_request_trace_context() {
        let broker = InMemoryBroker::new();
        let metrics = PipelineMetrics::new(Registry::new()).unwrap();
        let traceparent = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

        emitter(&broker, metrics)
            .publish(completed(), Some(traceparent))
            .await
            .unwrap();

        assert_eq!(broker.published_results()[0].traceparent(), Some(traceparent));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(2);
        let metrics = PipelineMetrics::new(Registry::new()).unwrap();

        let receipt = emitter(&broker, metrics.clone()).publish(completed(), None).await.unwrap();

        assert!(!receipt.duplicate);
        assert_eq!(broker.published().len(), 1);
        assert_eq!(metrics.result_publish_error_count(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(5);
        let metrics = PipelineMetrics::new(Registry::new()).unwrap();

        let err = emitter(&broker, metrics.clone()).publish(completed(), None).await.unwrap_err();

        assert!(matches!(err, EmitError::Exhausted { attempts: 3, .. }));
        assert!(broker.published().is_empty());
        assert_eq!(metrics.result_publish_error_count(), 3);
    }

    #[tokio::test]
    async fn re_emitting_a_result_is_deduplicated() {
        let broker = InMemoryBroker::new();
        let metrics = PipelineMetrics::new(Registry::new()).unwrap();
        let emitter = emitter(&broker, metrics);

        let first = emitter.publish(completed(), None).await.unwrap();
        let second = emitter.publish(completed(), None).await.unwrap();

        assert!(second.duplicate);
        assert_eq!(first.sequence, second.sequence);
        assert_eq!(broker.published().len(), 1);
    }
}
