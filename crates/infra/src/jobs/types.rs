//! Execution state and retry policy types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one job inside this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Delivered, not yet handed to the coordinator
    Received,
    /// Coordinator call in flight
    Executing,
    /// Completed result durably published
    Completed,
    /// Failed result durably published
    Failed,
}

/// Per-delivery record of one job, held by the execution guard.
///
/// Lives only while a handler holds the job; attempt history across
/// deliveries is the broker's delivery count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    pub attempt_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ExecutionState {
    pub fn received() -> Self {
        Self {
            status: ExecutionStatus::Received,
            attempt_count: 0,
            started_at: None,
            last_error: None,
        }
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::received()
    }
}

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    /// Doubles per attempt until `max_delay`.
    #[default]
    Doubling,
}

/// Attempt limit plus the delay before each redelivery.
///
/// `max_attempts` counts every attempt, the first one included.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// Fraction of the delay to spread around it, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            backoff: Backoff::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff: Backoff::Doubling,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Wait after failed attempt `attempt` (1-based). Never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let cap = self.max_delay.as_millis() as f64;
        let nominal = match self.backoff {
            Backoff::Fixed => self.base_delay.as_millis() as f64,
            Backoff::Doubling => {
                let factor = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (self.base_delay.as_millis() as f64 * factor).min(cap)
            }
        };

        // Spread is derived from the attempt number so delays are reproducible.
        let offset = ((attempt as f64 * 17.0) % 100.0) / 50.0 - 1.0;
        let spread = nominal * self.jitter * offset;

        Duration::from_millis((nominal + spread).clamp(0.0, cap) as u64)
    }

    /// Upper bound on the time spent sleeping between all attempts.
    pub fn worst_case_total(&self) -> Duration {
        (1..self.max_attempts.max(1)).map(|_| self.max_delay).sum()
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
