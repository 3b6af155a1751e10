//! NATS JetStream-backed job source and status transport.
//!
//! Two streams are used:
//! - the inbound job stream (e.g. `AGENT_EXECUTION`, subjects `agent.execute.*`),
//!   read through a durable pull consumer with explicit acknowledgement;
//! - the outbound status stream (e.g. `AGENT_STATUS`, subjects `agent.status.>`),
//!   written with a `Nats-Msg-Id` header so re-emitted results are dropped by
//!   the stream's duplicate window.
//!
//! Both streams and the consumer are created idempotently on connect.

use std::time::Duration;

use async_nats::jetstream::{self, AckKind, consumer, stream};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::timeout;
use tracing::{debug, info, instrument};

use super::{BrokerError, Delivery, JobSource, PublishReceipt, StatusTransport};
use crate::config::NatsConfig;

/// Header carrying the message id used for JetStream dedup.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

#[derive(Clone)]
pub struct NatsJetStream {
    client: async_nats::Client,
    context: jetstream::Context,
    consumer: consumer::PullConsumer,
    fetch_expiry: Duration,
}

impl NatsJetStream {
    /// Connect, then ensure both streams and the durable consumer exist.
    #[instrument(skip(config), fields(url = %config.url, stream = %config.stream), err)]
    pub async fn connect(config: &NatsConfig) -> Result<Self, BrokerError> {
        let options = async_nats::ConnectOptions::new()
            .name(config.consumer_group.as_str())
            .connection_timeout(config.connect_timeout);

        let client = timeout(
            config.connect_timeout,
            async_nats::connect_with_options(config.url.as_str(), options),
        )
        .await
        .map_err(|_| BrokerError::Connection(format!("timed out connecting to {}", config.url)))?
        .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let context = jetstream::new(client.clone());

        let jobs = context
            .get_or_create_stream(stream::Config {
                name: config.stream.clone(),
                subjects: vec![config.subject.clone()],
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Setup(format!("job stream {}: {e}", config.stream)))?;

        context
            .get_or_create_stream(stream::Config {
                name: config.status_stream.clone(),
                subjects: vec![format!("{}.>", config.status_subject_prefix)],
                duplicate_window: config.duplicate_window,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                BrokerError::Setup(format!("status stream {}: {e}", config.status_stream))
            })?;

        let consumer: consumer::PullConsumer = jobs
            .get_or_create_consumer(
                &config.consumer_group,
                consumer::pull::Config {
                    durable_name: Some(config.consumer_group.clone()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ack_wait: config.ack_wait,
                    deliver_policy: consumer::DeliverPolicy::All,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                BrokerError::Setup(format!("consumer {}: {e}", config.consumer_group))
            })?;

        info!(
            consumer = %config.consumer_group,
            status_stream = %config.status_stream,
            "connected to NATS JetStream"
        );

        Ok(Self {
            client,
            context,
            consumer,
            fetch_expiry: config.fetch_expiry,
        })
    }

    /// Flush pending publishes before the connection is dropped.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

#[async_trait]
impl JobSource for NatsJetStream {
    async fn fetch(&self, max: usize) -> Result<Vec<Box<dyn Delivery>>, BrokerError> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max)
            .expires(self.fetch_expiry)
            .messages()
            .await
            .map_err(|e| BrokerError::Fetch(e.to_string()))?;

        let mut deliveries: Vec<Box<dyn Delivery>> = Vec::with_capacity(max);
        while let Some(message) = batch.next().await {
            let message = message.map_err(|e| BrokerError::Fetch(e.to_string()))?;
            deliveries.push(Box::new(NatsDelivery { message }));
        }

        if !deliveries.is_empty() {
            debug!(count = deliveries.len(), "fetched job messages");
        }
        Ok(deliveries)
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }
}

#[async_trait]
impl StatusTransport for NatsJetStream {
    async fn publish(
        &self,
        subject: &str,
        msg_id: &str,
        payload: Vec<u8>,
    ) -> Result<PublishReceipt, BrokerError> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(MSG_ID_HEADER, msg_id);

        let ack = self
            .context
            .publish_with_headers(subject.to_string(), headers, payload.into())
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        Ok(PublishReceipt {
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }
}

struct NatsDelivery {
    message: jetstream::Message,
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn delivery_count(&self) -> u32 {
        self.message
            .info()
            .map(|info| info.delivered.max(1) as u32)
            .unwrap_or(1)
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.message
            .ack()
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nak(&self, delay: Duration) -> Result<(), BrokerError> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
