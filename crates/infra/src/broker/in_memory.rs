//! In-memory broker for tests/dev.
//!
//! Models the parts of a durable stream the pipeline relies on: explicit
//! ack, nak-with-redelivery (delivery count increments), message-id dedup on
//! the status stream, and a connection flag that can be flipped.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use agentexec_events::{Envelope, ResultData};

use super::{BrokerError, Delivery, JobSource, PublishReceipt, StatusTransport};

#[derive(Debug, Clone)]
struct QueuedMessage {
    sequence: u64,
    subject: String,
    payload: Vec<u8>,
    delivered: u32,
}

/// A result published to the status stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub sequence: u64,
    pub subject: String,
    pub msg_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_sequence: u64,
    pending: VecDeque<QueuedMessage>,
    acked: Vec<u64>,
    naks: Vec<(u64, Duration)>,
    published: Vec<PublishedMessage>,
    seen_msg_ids: HashSet<String>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BrokerState>,
    connected: AtomicBool,
    failing_publishes: AtomicU32,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory job stream plus status stream.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                connected: AtomicBool::new(true),
                failing_publishes: AtomicU32::new(0),
            }),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job message to the inbound stream; returns its sequence.
    pub fn enqueue(&self, subject: impl Into<String>, payload: Vec<u8>) -> u64 {
        let mut state = self.shared.lock();
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.pending.push_back(QueuedMessage {
            sequence,
            subject: subject.into(),
            payload,
            delivered: 0,
        });
        sequence
    }

    pub fn set_connected(&self, connected: bool) {
        self.shared.connected.store(connected, Ordering::SeqCst);
    }

    /// Make the next `n` result publishes fail.
    pub fn fail_next_publishes(&self, n: u32) {
        self.shared.failing_publishes.store(n, Ordering::SeqCst);
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.shared.lock().acked.clone()
    }

    pub fn naks(&self) -> Vec<(u64, Duration)> {
        self.shared.lock().naks.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.lock().published.clone()
    }

    /// Published results decoded as result envelopes (undecodable ones skipped).
    pub fn published_results(&self) -> Vec<Envelope<ResultData>> {
        self.published()
            .iter()
            .filter_map(|m| Envelope::<ResultData>::decode(&m.payload).ok())
            .collect()
    }
}

#[async_trait]
impl JobSource for InMemoryBroker {
    async fn fetch(&self, max: usize) -> Result<Vec<Box<dyn Delivery>>, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::Connection("in-memory broker disconnected".to_string()));
        }

        let mut state = self.shared.lock();
        let take = max.min(state.pending.len());
        let batch = state
            .pending
            .drain(..take)
            .map(|mut message| {
                message.delivered += 1;
                Box::new(InMemoryDelivery {
                    message,
                    shared: self.shared.clone(),
                }) as Box<dyn Delivery>
            })
            .collect();
        Ok(batch)
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusTransport for InMemoryBroker {
    async fn publish(
        &self,
        subject: &str,
        msg_id: &str,
        payload: Vec<u8>,
    ) -> Result<PublishReceipt, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::Connection("in-memory broker disconnected".to_string()));
        }
        let failing = self.shared.failing_publishes.load(Ordering::SeqCst);
        if failing > 0 {
            self.shared.failing_publishes.store(failing - 1, Ordering::SeqCst);
            return Err(BrokerError::Publish("injected publish failure".to_string()));
        }

        let mut state = self.shared.lock();
        if !state.seen_msg_ids.insert(msg_id.to_string()) {
            let sequence = state
                .published
                .iter()
                .find(|m| m.msg_id == msg_id)
                .map(|m| m.sequence)
                .unwrap_or_default();
            return Ok(PublishReceipt {
                sequence,
                duplicate: true,
            });
        }

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.published.push(PublishedMessage {
            sequence,
            subject: subject.to_string(),
            msg_id: msg_id.to_string(),
            payload,
        });
        Ok(PublishReceipt {
            sequence,
            duplicate: false,
        })
    }
}

struct InMemoryDelivery {
    message: QueuedMessage,
    shared: Arc<Shared>,
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn subject(&self) -> &str {
        &self.message.subject
    }

    fn delivery_count(&self) -> u32 {
        self.message.delivered
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.shared.lock().acked.push(self.message.sequence);
        Ok(())
    }

    async fn nak(&self, delay: Duration) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        state.naks.push((self.message.sequence, delay));
        state.pending.push_back(self.message.clone());
        Ok(())
    }
}
