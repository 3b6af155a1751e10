//! Redis pub/sub-backed progress sink.
//!
//! Note: Redis pub/sub is not durable; a subscriber that is offline misses the
//! event. That matches the progress contract (best-effort, no replay).

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, instrument};

use agentexec_events::{ProgressError, ProgressEvent, ProgressSink, progress_channel};

/// Publishes each event as JSON on `<prefix>:<job_id>`.
#[derive(Clone)]
pub struct RedisProgressSink {
    conn: ConnectionManager,
    channel_prefix: String,
}

impl RedisProgressSink {
    /// Connect (the manager reconnects on its own afterwards).
    #[instrument(skip_all, err)]
    pub async fn connect(
        redis_url: &str,
        channel_prefix: impl Into<String>,
    ) -> Result<Self, ProgressError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| ProgressError::Unavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| ProgressError::Unavailable(e.to_string()))?;

        Ok(Self {
            conn,
            channel_prefix: channel_prefix.into(),
        })
    }
}

#[async_trait]
impl ProgressSink for RedisProgressSink {
    async fn publish(&self, event: &ProgressEvent) -> Result<(), ProgressError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| ProgressError::Serialization(e.to_string()))?;
        let channel = progress_channel(&self.channel_prefix, &event.job_id);

        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(&channel, payload)
            .await
            .map_err(|e| ProgressError::Unavailable(e.to_string()))?;

        debug!(%channel, receivers, "progress published");
        Ok(())
    }
}
