//! Durable broker boundary.
//!
//! The job consumer only sees these traits; `NatsJetStream` is the production
//! implementation and `InMemoryBroker` backs tests.
//!
//! Delivery semantics assumed everywhere: at-least-once. A message stays on the
//! stream until it is acknowledged; `nak` asks for redelivery after a delay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod in_memory;
#[cfg(feature = "nats")]
pub mod nats_jetstream;

pub use in_memory::{InMemoryBroker, PublishedMessage};
#[cfg(feature = "nats")]
pub use nats_jetstream::NatsJetStream;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("stream/consumer setup failed: {0}")]
    Setup(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("acknowledgement failed: {0}")]
    Ack(String),

    #[error("publish failed: {0}")]
    Publish(String),
}

/// One delivered job message.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    fn subject(&self) -> &str;

    /// How many times the broker has delivered this message (1 on first delivery).
    fn delivery_count(&self) -> u32;

    /// Remove the message from the stream.
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Hand the message back for redelivery after `delay`.
    async fn nak(&self, delay: Duration) -> Result<(), BrokerError>;
}

/// Source of job messages (a durable consumer).
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Pull up to `max` messages. May return fewer, or none, when the stream is idle.
    async fn fetch(&self, max: usize) -> Result<Vec<Box<dyn Delivery>>, BrokerError>;

    /// Whether the underlying connection is currently open.
    fn is_connected(&self) -> bool;
}

/// Broker acknowledgement of a published result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Stream sequence assigned to the message.
    pub sequence: u64,
    /// The broker recognised the message id and dropped this copy.
    pub duplicate: bool,
}

/// Durable publication of terminal results.
#[async_trait]
pub trait StatusTransport: Send + Sync {
    /// Publish and wait for the broker to confirm persistence.
    ///
    /// `msg_id` is used for broker-side dedup of re-emitted results.
    async fn publish(
        &self,
        subject: &str,
        msg_id: &str,
        payload: Vec<u8>,
    ) -> Result<PublishReceipt, BrokerError>;
}

#[async_trait]
impl<S> JobSource for Arc<S>
where
    S: JobSource + ?Sized,
{
    async fn fetch(&self, max: usize) -> Result<Vec<Box<dyn Delivery>>, BrokerError> {
        (**self).fetch(max).await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

#[async_trait]
impl<S> StatusTransport for Arc<S>
where
    S: StatusTransport + ?Sized,
{
    async fn publish(
        &self,
        subject: &str,
        msg_id: &str,
        payload: Vec<u8>,
    ) -> Result<PublishReceipt, BrokerError> {
        (**self).publish(subject, msg_id, payload).await
    }
}
