//! Pipeline wiring: connect every external dependency and assemble the consumer.

use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::info;

use agentexec_infra::PipelineConfig;
use agentexec_infra::broker::NatsJetStream;
use agentexec_infra::checkpoint_store::PostgresCheckpointStore;
use agentexec_infra::jobs::{
    ExecutionCoordinator, JobConsumer, ReplayConfig, ReplayCoordinator, ResultEmitter,
};
use agentexec_infra::progress::{ProgressConfig, ProgressPublisher, RedisProgressSink};
use agentexec_observability::PipelineMetrics;

pub struct Services {
    pub consumer: Arc<JobConsumer>,
    pub broker: NatsJetStream,
}

/// Pick the coordinator for the configured execution mode.
pub fn build_coordinator(config: &PipelineConfig) -> anyhow::Result<Arc<dyn ExecutionCoordinator>> {
    match ReplayConfig::from_mode(&config.mode).context("loading replay events")? {
        Some(replay) => {
            info!(
                events = replay.events.len(),
                delay_ms = replay.event_delay.as_millis() as u64,
                "using replay coordinator"
            );
            Ok(Arc::new(ReplayCoordinator::new(replay)))
        }
        None => bail!(
            "EXECUTION_MODE=external needs a coordinator supplied by the embedding application"
        ),
    }
}

pub async fn build_services(
    config: &PipelineConfig,
    metrics: PipelineMetrics,
) -> anyhow::Result<Services> {
    let coordinator = build_coordinator(config)?;

    let broker = NatsJetStream::connect(&config.nats)
        .await
        .context("connecting to NATS")?;

    let sink = RedisProgressSink::connect(&config.redis.url(), config.redis.channel_prefix.clone())
        .await
        .context("connecting to the progress bus")?;
    let progress = ProgressPublisher::spawn(
        Arc::new(sink),
        metrics.clone(),
        ProgressConfig::default().with_publish_timeout(config.redis.publish_timeout),
    );

    let store = PostgresCheckpointStore::connect(&config.postgres)
        .await
        .context("connecting to the checkpoint store")?;
    store
        .ensure_schema()
        .await
        .context("creating the checkpoint table")?;

    let emitter = ResultEmitter::new(
        Arc::new(broker.clone()),
        config.emitter.clone(),
        metrics.clone(),
    );
    let consumer = JobConsumer::new(
        config.consumer.clone(),
        Arc::new(broker.clone()),
        coordinator,
        Arc::new(store),
        progress,
        emitter,
        metrics,
    );

    Ok(Services {
        consumer: Arc::new(consumer),
        broker,
    })
}
