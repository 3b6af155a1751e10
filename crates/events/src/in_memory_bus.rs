//! In-memory progress bus for tests/dev.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, mpsc};
use std::time::Duration;

use async_trait::async_trait;

use agentexec_core::JobId;

use crate::progress::{ProgressError, ProgressEvent, ProgressSink};

/// A subscription to progress events.
///
/// Receives every event published after it was created (broadcast semantics);
/// anything published earlier is lost, as with a real pub/sub channel.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything received so far.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

struct Subscriber {
    job_id: Option<JobId>,
    sender: mpsc::Sender<ProgressEvent>,
}

/// In-memory pub/sub bus for progress events.
///
/// - No IO
/// - Best-effort fan-out, dead subscribers are dropped on publish
/// - Can be switched offline to exercise "channel unavailable" paths
pub struct InMemoryProgressBus {
    subscribers: Mutex<Vec<Subscriber>>,
    available: AtomicBool,
}

impl InMemoryProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every job's progress.
    pub fn subscribe(&self) -> Subscription<ProgressEvent> {
        self.add_subscriber(None)
    }

    /// Subscribe to one job's channel.
    pub fn subscribe_job(&self, job_id: &JobId) -> Subscription<ProgressEvent> {
        self.add_subscriber(Some(job_id.clone()))
    }

    /// Simulate the bus going away (publishes fail) or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn add_subscriber(&self, job_id: Option<JobId>) -> Subscription<ProgressEvent> {
        let (sender, receiver) = mpsc::channel();

        // If the lock is poisoned we still hand back a subscription;
        // it just never receives anything.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(Subscriber { job_id, sender });
        }

        Subscription::new(receiver)
    }
}

impl Default for InMemoryProgressBus {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl ProgressSink for InMemoryProgressBus {
    async fn publish(&self, event: &ProgressEvent) -> Result<(), ProgressError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ProgressError::Unavailable("in-memory bus offline".to_string()));
        }

        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| ProgressError::Unavailable("lock poisoned".to_string()))?;

        let before = subs.len();
        subs.retain(|sub| match &sub.job_id {
            Some(job_id) if job_id != &event.job_id => true,
            _ => sub.sender.send(event.clone()).is_ok(),
        });
        if subs.len() < before {
            tracing::debug!(dropped = before - subs.len(), "removed closed progress subscribers");
        }

        Ok(())
    }
}
