//! Prometheus metrics for the job pipeline.
//!
//! Every metric lives on a `Registry` handed in by the caller, never on the
//! process-global default registry, so tests and embedded pipelines can each
//! own an isolated set.

use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;

/// Buckets for `agent_executor_job_duration_seconds` (jobs run for minutes).
pub const JOB_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// Content type of the text exposition format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric registration failed: {0}")]
    Registration(String),

    #[error("metric encoding failed: {0}")]
    Encoding(String),
}

/// Counters and histograms for the pipeline.
///
/// Cloning is cheap; clones update the same underlying series.
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,
    jobs_total: IntCounterVec,
    job_duration: Histogram,
    jobs_retried: IntCounter,
    jobs_in_flight: IntGauge,
    duplicate_deliveries: IntCounter,
    db_connection_errors: IntCounter,
    redis_publish_total: IntCounterVec,
    redis_publish_errors: IntCounter,
    nats_messages_processed: IntCounter,
    nats_messages_failed: IntCounter,
    nats_connection_errors: IntCounter,
    result_publish_errors: IntCounter,
}

impl PipelineMetrics {
    /// Create the pipeline metrics and register them on `registry`.
    pub fn new(registry: Registry) -> Result<Self, MetricsError> {
        let jobs_total = IntCounterVec::new(
            Opts::new("agent_executor_jobs_total", "Jobs reaching a terminal outcome, by status"),
            &["status"],
        )
        .map_err(registration)?;
        let job_duration = Histogram::with_opts(
            HistogramOpts::new(
                "agent_executor_job_duration_seconds",
                "Wall-clock duration of job executions",
            )
            .buckets(JOB_DURATION_BUCKETS.to_vec()),
        )
        .map_err(registration)?;
        let jobs_retried = counter(
            "agent_executor_jobs_retried_total",
            "Failed attempts handed back to the broker for redelivery",
        )?;
        let jobs_in_flight = IntGauge::new(
            "agent_executor_jobs_in_flight",
            "Executions currently running in this process",
        )
        .map_err(registration)?;
        let duplicate_deliveries = counter(
            "agent_executor_duplicate_deliveries_total",
            "Deliveries dropped because the job was already executing",
        )?;
        let db_connection_errors = counter(
            "agent_executor_db_connection_errors_total",
            "Checkpoint store errors",
        )?;
        let redis_publish_total = IntCounterVec::new(
            Opts::new("agent_executor_redis_publish_total", "Progress events published, by event type"),
            &["event_type"],
        )
        .map_err(registration)?;
        let redis_publish_errors = counter(
            "agent_executor_redis_publish_errors_total",
            "Progress events that could not be published",
        )?;
        let nats_messages_processed = counter(
            "agent_executor_nats_messages_processed_total",
            "Job messages processed to a terminal outcome",
        )?;
        let nats_messages_failed = counter(
            "agent_executor_nats_messages_failed_total",
            "Job messages that failed (malformed or terminally failed)",
        )?;
        let nats_connection_errors = counter(
            "agent_executor_nats_connection_errors_total",
            "Broker fetch/connection errors seen by the pull loop",
        )?;
        let result_publish_errors = counter(
            "agent_executor_result_publish_errors_total",
            "Failed attempts to publish a terminal result",
        )?;

        let metrics = Self {
            registry,
            jobs_total,
            job_duration,
            jobs_retried,
            jobs_in_flight,
            duplicate_deliveries,
            db_connection_errors,
            redis_publish_total,
            redis_publish_errors,
            nats_messages_processed,
            nats_messages_failed,
            nats_connection_errors,
            result_publish_errors,
        };
        metrics.register_all()?;
        Ok(metrics)
    }

    fn register_all(&self) -> Result<(), MetricsError> {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(self.jobs_total.clone()),
            Box::new(self.job_duration.clone()),
            Box::new(self.jobs_retried.clone()),
            Box::new(self.jobs_in_flight.clone()),
            Box::new(self.duplicate_deliveries.clone()),
            Box::new(self.db_connection_errors.clone()),
            Box::new(self.redis_publish_total.clone()),
            Box::new(self.redis_publish_errors.clone()),
            Box::new(self.nats_messages_processed.clone()),
            Box::new(self.nats_messages_failed.clone()),
            Box::new(self.nats_connection_errors.clone()),
            Box::new(self.result_publish_errors.clone()),
        ];
        for collector in collectors {
            self.registry.register(collector).map_err(registration)?;
        }
        Ok(())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn job_finished(&self, status: &str, duration: Duration) {
        self.jobs_total.with_label_values(&[status]).inc();
        self.job_duration.observe(duration.as_secs_f64());
    }

    /// Count a message that ended without running (malformed payload).
    pub fn job_rejected(&self, status: &str) {
        self.jobs_total.with_label_values(&[status]).inc();
    }

    pub fn job_retried(&self) {
        self.jobs_retried.inc();
    }

    pub fn execution_started(&self) {
        self.jobs_in_flight.inc();
    }

    pub fn execution_finished(&self) {
        self.jobs_in_flight.dec();
    }

    pub fn duplicate_delivery(&self) {
        self.duplicate_deliveries.inc();
    }

    pub fn db_error(&self) {
        self.db_connection_errors.inc();
    }

    pub fn progress_published(&self, event_type: &str) {
        self.redis_publish_total.with_label_values(&[event_type]).inc();
    }

    pub fn progress_publish_failed(&self) {
        self.redis_publish_errors.inc();
    }

    pub fn message_processed(&self) {
        self.nats_messages_processed.inc();
    }

    pub fn message_failed(&self) {
        self.nats_messages_failed.inc();
    }

    pub fn broker_connection_error(&self) {
        self.nats_connection_errors.inc();
    }

    pub fn result_publish_failed(&self) {
        self.result_publish_errors.inc();
    }

    pub fn jobs_count(&self, status: &str) -> u64 {
        self.jobs_total.with_label_values(&[status]).get()
    }

    pub fn retried_count(&self) -> u64 {
        self.jobs_retried.get()
    }

    pub fn in_flight(&self) -> i64 {
        self.jobs_in_flight.get()
    }

    pub fn duplicate_count(&self) -> u64 {
        self.duplicate_deliveries.get()
    }

    pub fn db_error_count(&self) -> u64 {
        self.db_connection_errors.get()
    }

    pub fn progress_published_count(&self, event_type: &str) -> u64 {
        self.redis_publish_total.with_label_values(&[event_type]).get()
    }

    pub fn progress_error_count(&self) -> u64 {
        self.redis_publish_errors.get()
    }

    pub fn processed_count(&self) -> u64 {
        self.nats_messages_processed.get()
    }

    pub fn failed_message_count(&self) -> u64 {
        self.nats_messages_failed.get()
    }

    pub fn result_publish_error_count(&self) -> u64 {
        self.result_publish_errors.get()
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String, MetricsError> {
        render(&self.registry)
    }
}

/// Render any registry in the Prometheus text format.
pub fn render(registry: &Registry) -> Result<String, MetricsError> {
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buf)
        .map_err(|e| MetricsError::Encoding(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| MetricsError::Encoding(e.to_string()))
}

fn counter(name: &str, help: &str) -> Result<IntCounter, MetricsError> {
    IntCounter::new(name, help).map_err(registration)
}

fn registration(err: prometheus::Error) -> MetricsError {
    MetricsError::Registration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separate_registries_do_not_share_series() {
        let a = PipelineMetrics::new(Registry::new()).unwrap();
        let b = PipelineMetrics::new(Registry::new()).unwrap();

        a.job_finished("completed", Duration::from_millis(200));
        a.job_finished("completed", Duration::from_secs(3));

        assert_eq!(a.jobs_count("completed"), 2);
        assert_eq!(b.jobs_count("completed"), 0);
    }

    #[test]
    fn registering_twice_on_one_registry_fails() {
        let registry = Registry::new();
        PipelineMetrics::new(registry.clone()).unwrap();
        assert!(matches!(
            PipelineMetrics::new(registry),
            Err(MetricsError::Registration(_))
        ));
    }

    #[test]
    fn text_exposition_contains_pipeline_series() {
        let metrics = PipelineMetrics::new(Registry::new()).unwrap();
        metrics.job_finished("failed", Duration::from_secs(1));
        metrics.progress_published("tool_start");
        metrics.db_error();

        let text = metrics.render().unwrap();
        assert!(text.contains("agent_executor_jobs_total{status=\"failed\"} 1"));
        assert!(text.contains("agent_executor_redis_publish_total{event_type=\"tool_start\"} 1"));
        assert!(text.contains("agent_executor_db_connection_errors_total 1"));
        assert!(text.contains("agent_executor_job_duration_seconds_bucket"));
    }

    #[test]
    fn in_flight_gauge_tracks_start_and_finish() {
        let metrics = PipelineMetrics::new(Registry::new()).unwrap();
        metrics.execution_started();
        metrics.execution_started();
        metrics.execution_finished();
        assert_eq!(metrics.in_flight(), 1);
    }
}
