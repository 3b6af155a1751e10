//! Configuration loading and representation.
//!
//! Everything is read from environment variables (a `.env` file is loaded by
//! the binary first). `PipelineConfig::from_lookup` takes the lookup as a
//! closure so tests never touch the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use agentexec_events::DEFAULT_CHANNEL_PREFIX;

use crate::jobs::consumer::ConsumerConfig;
use crate::jobs::emitter::EmitterConfig;
use crate::jobs::types::RetryPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// How jobs are executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Replay captured progress events instead of running a live workflow.
    Replay {
        events_file: Option<PathBuf>,
        event_delay: Duration,
    },
    /// An external coordinator is supplied by the embedding application.
    External,
}

impl ExecutionMode {
    pub fn is_replay(&self) -> bool {
        matches!(self, ExecutionMode::Replay { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsConfig {
    pub url: String,
    pub stream: String,
    pub subject: String,
    pub consumer_group: String,
    pub status_stream: String,
    pub status_subject_prefix: String,
    pub connect_timeout: Duration,
    /// How long a pull request waits for messages before returning empty.
    pub fetch_expiry: Duration,
    /// Broker redelivery timeout for unacknowledged messages.
    pub ack_wait: Duration,
    /// Dedup window for result message ids. At least `ack_wait` plus the
    /// emitter's retry time, so a result re-emitted after a lost ack is still
    /// recognised as a duplicate.
    pub duplicate_window: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub channel_prefix: String,
    pub publish_timeout: Duration,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{pw}@{}:{}/0", self.host, self.port),
            None => format!("redis://{}:{}/0", self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub schema: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub nats: NatsConfig,
    pub redis: RedisConfig,
    pub postgres: PostgresConfig,
    pub consumer: ConsumerConfig,
    pub emitter: EmitterConfig,
    pub mode: ExecutionMode,
    pub http_bind: String,
}

impl PipelineConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let mode = parse_mode(&env)?;
        let default_timeout = if mode.is_replay() {
            env.parse("MOCK_TIMEOUT", 30u64)?
        } else {
            env.parse("REAL_TIMEOUT", 480u64)?
        };
        let job_timeout = Duration::from_secs(env.parse("JOB_TIMEOUT_SECS", default_timeout)?);
        if job_timeout.is_zero() {
            return Err(ConfigError::invalid("JOB_TIMEOUT_SECS", "must be positive"));
        }

        let max_attempts: u32 = env.parse("MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::invalid("MAX_ATTEMPTS", "must be at least 1"));
        }
        let max_in_flight: usize = env.parse("MAX_IN_FLIGHT", 4)?;
        if max_in_flight == 0 {
            return Err(ConfigError::invalid("MAX_IN_FLIGHT", "must be at least 1"));
        }
        let batch_size: usize = env.parse("FETCH_BATCH_SIZE", 10)?;
        if batch_size == 0 {
            return Err(ConfigError::invalid("FETCH_BATCH_SIZE", "must be at least 1"));
        }
        let publish_attempts: u32 = env.parse("PUBLISH_MAX_ATTEMPTS", 3)?;
        if publish_attempts == 0 {
            return Err(ConfigError::invalid("PUBLISH_MAX_ATTEMPTS", "must be at least 1"));
        }

        let retry = RetryPolicy::exponential(
            max_attempts,
            Duration::from_millis(env.parse("RETRY_BASE_DELAY_MS", 1_000)?),
            Duration::from_millis(env.parse("RETRY_MAX_DELAY_MS", 60_000)?),
        );
        let source = env.string("EVENT_SOURCE", "agent-executor");

        let consumer = ConsumerConfig::default()
            .with_name(env.string("NATS_CONSUMER_GROUP", "agent-executor-workers"))
            .with_max_in_flight(max_in_flight)
            .with_batch_size(batch_size)
            .with_job_timeout(job_timeout)
            .with_shutdown_grace(Duration::from_secs(env.parse("SHUTDOWN_GRACE_SECS", 30)?))
            .with_retry(retry);

        let emitter = EmitterConfig::default()
            .with_source(source)
            .with_subject_prefix(env.string("NATS_STATUS_SUBJECT_PREFIX", "agent.status"))
            .with_retry(RetryPolicy::exponential(
                publish_attempts,
                Duration::from_millis(200),
                Duration::from_secs(5),
            ));

        // Must outlive the longest execution or the broker redelivers mid-run.
        let ack_wait = job_timeout + Duration::from_secs(60);
        let min_window = ack_wait + emitter.retry.worst_case_total();
        let duplicate_window = match env.optional("NATS_DUPLICATE_WINDOW_SECS") {
            None => min_window + Duration::from_secs(60),
            Some(_) => {
                let window = Duration::from_secs(env.parse("NATS_DUPLICATE_WINDOW_SECS", 0)?);
                if window < min_window {
                    return Err(ConfigError::invalid(
                        "NATS_DUPLICATE_WINDOW_SECS",
                        format!(
                            "must be at least {}s (ack wait plus publish retries)",
                            min_window.as_secs()
                        ),
                    ));
                }
                window
            }
        };

        let nats = NatsConfig {
            url: env.string("NATS_URL", "nats://localhost:4222"),
            stream: env.string("NATS_STREAM_NAME", "AGENT_EXECUTION"),
            subject: env.string("NATS_SUBJECT", "agent.execute.*"),
            consumer_group: consumer.name.clone(),
            status_stream: env.string("NATS_STATUS_STREAM", "AGENT_STATUS"),
            status_subject_prefix: emitter.subject_prefix.clone(),
            connect_timeout: Duration::from_secs(env.parse("NATS_CONNECT_TIMEOUT_SECS", 5)?),
            fetch_expiry: Duration::from_millis(env.parse("NATS_FETCH_EXPIRY_MS", 1_000)?),
            ack_wait,
            duplicate_window,
        };

        let redis = RedisConfig {
            host: env.string("DRAGONFLY_HOST", "localhost"),
            port: env.parse("DRAGONFLY_PORT", 6379)?,
            password: env.optional("DRAGONFLY_PASSWORD"),
            channel_prefix: env.string("PROGRESS_CHANNEL_PREFIX", DEFAULT_CHANNEL_PREFIX),
            publish_timeout: Duration::from_millis(env.parse("PROGRESS_PUBLISH_TIMEOUT_MS", 500)?),
        };

        let schema = env.string("POSTGRES_SCHEMA", "public");
        if !is_identifier(&schema) {
            return Err(ConfigError::invalid("POSTGRES_SCHEMA", "not a valid SQL identifier"));
        }
        let postgres = PostgresConfig {
            host: env.string("POSTGRES_HOST", "localhost"),
            port: env.parse("POSTGRES_PORT", 5432)?,
            database: env.string("POSTGRES_DB", "agent_executor"),
            user: env.string("POSTGRES_USER", "postgres"),
            password: env.optional("POSTGRES_PASSWORD"),
            schema,
            max_connections: env.parse("POSTGRES_MAX_CONNECTIONS", 5)?,
        };

        Ok(Self {
            nats,
            redis,
            postgres,
            consumer,
            emitter,
            mode,
            http_bind: env.string("HTTP_BIND", "0.0.0.0:8080"),
        })
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e: T::Err| ConfigError::invalid(key, format!("{raw:?}: {e}"))),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.optional(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(None),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                other => Err(ConfigError::invalid(key, format!("{other:?} is not a boolean"))),
            },
        }
    }
}

fn parse_mode<F>(env: &Env<'_, F>) -> Result<ExecutionMode, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mock_llm = env.flag("USE_MOCK_LLM")?;
    let name = match env.optional("EXECUTION_MODE") {
        Some(name) => name.to_ascii_lowercase(),
        None if mock_llm == Some(false) => "external".to_string(),
        None => "replay".to_string(),
    };

    match name.as_str() {
        "replay" => Ok(ExecutionMode::Replay {
            events_file: env.optional("MOCK_EVENTS_FILE").map(PathBuf::from),
            event_delay: Duration::from_millis(env.parse("MOCK_EVENT_DELAY", 5)?),
        }),
        "external" => Ok(ExecutionMode::External),
        other => Err(ConfigError::invalid(
            "EXECUTION_MODE",
            format!("unknown mode {other:?} (expected \"replay\" or \"external\")"),
        )),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_describe_a_local_replay_setup() {
        let cfg = load(&[]).unwrap();

        assert_eq!(cfg.nats.url, "nats://localhost:4222");
        assert_eq!(cfg.nats.stream, "AGENT_EXECUTION");
        assert_eq!(cfg.nats.consumer_group, "agent-executor-workers");
        assert_eq!(cfg.emitter.subject_prefix, "agent.status");
        assert_eq!(cfg.redis.url(), "redis://localhost:6379/0");
        assert_eq!(cfg.redis.channel_prefix, "langgraph:stream");
        assert_eq!(cfg.consumer.retry.max_attempts, 3);
        assert_eq!(cfg.consumer.job_timeout, Duration::from_secs(30));
        assert!(cfg.mode.is_replay());
        assert!(cfg.nats.ack_wait > cfg.consumer.job_timeout);
    }

    #[test]
    fn real_mode_uses_real_timeout() {
        let cfg = load(&[("USE_MOCK_LLM", "false"), ("REAL_TIMEOUT", "600")]).unwrap();
        assert_eq!(cfg.mode, ExecutionMode::External);
        assert_eq!(cfg.consumer.job_timeout, Duration::from_secs(600));
    }

    #[test]
    fn redis_url_includes_password() {
        let cfg = load(&[
            ("DRAGONFLY_HOST", "dragonfly"),
            ("DRAGONFLY_PORT", "6380"),
            ("DRAGONFLY_PASSWORD", "s3cret"),
        ])
        .unwrap();
        assert_eq!(cfg.redis.url(), "redis://:s3cret@dragonfly:6380/0");
    }

    #[test]
    fn replay_mode_reads_mock_settings() {
        let cfg = load(&[
            ("EXECUTION_MODE", "Replay"),
            ("MOCK_EVENTS_FILE", "/data/all_events.json"),
            ("MOCK_EVENT_DELAY", "1"),
        ])
        .unwrap();
        assert_eq!(
            cfg.mode,
            ExecutionMode::Replay {
                events_file: Some(PathBuf::from("/data/all_events.json")),
                event_delay: Duration::from_millis(1),
            }
        );
    }

    #[test]
    fn unknown_mode_is_rejected_at_load() {
        let err = load(&[("EXECUTION_MODE", "langgraph")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "EXECUTION_MODE"));
    }

    #[test]
    fn bad_numbers_and_limits_are_rejected() {
        assert!(load(&[("MAX_ATTEMPTS", "three")]).is_err());
        assert!(load(&[("MAX_ATTEMPTS", "0")]).is_err());
        assert!(load(&[("MAX_IN_FLIGHT", "0")]).is_err());
        assert!(load(&[("POSTGRES_PORT", "99999")]).is_err());
        assert!(load(&[("USE_MOCK_LLM", "maybe")]).is_err());
    }

    #[test]
    fn duplicate_window_covers_redelivery_after_a_lost_ack() {
        let cfg = load(&[("USE_MOCK_LLM", "false"), ("REAL_TIMEOUT", "600")]).unwrap();
        assert!(cfg.nats.duplicate_window >= cfg.nats.ack_wait + cfg.emitter.retry.worst_case_total());

        let err = load(&[
            ("USE_MOCK_LLM", "false"),
            ("REAL_TIMEOUT", "600"),
            ("NATS_DUPLICATE_WINDOW_SECS", "120"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "NATS_DUPLICATE_WINDOW_SECS"));

        let cfg = load(&[("NATS_DUPLICATE_WINDOW_SECS", "3600")]).unwrap();
        assert_eq!(cfg.nats.duplicate_window, Duration::from_secs(3600));
    }

    #[test]
    fn schema_must_be_an_identifier() {
        assert!(load(&[("POSTGRES_SCHEMA", "agents")]).is_ok());
        assert!(load(&[("POSTGRES_SCHEMA", "a; drop table x")]).is_err());
    }
}
