//! Configuration loaded from environment variables.
//!
//! Every setting has a default except the API key of a hosted LLM provider
//! (Ollama runs without one). Parsing goes through
//! a lookup function so tests can supply values without touching the process
//! environment.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::broker::{CONSUMER_NAME, CursorSpec, STREAM_NAME, SUBJECT_NAME, StorageMode, StreamSpec};
use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::pipeline::analyzer::{AnalyzerConfig, DEFAULT_AGENT_NAME, DEFAULT_INSTRUCTIONS};
use crate::pipeline::consumer::{Backoff, FetchConfig};
use crate::pipeline::queue::QueueConfig;

/// Default broker address.
pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";

/// Default libSQL database file.
pub const DEFAULT_DB_PATH: &str = "./data/agent.db";

const PREFIX: &str = "LOG_ANALYST_";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub nats_url: String,
    pub stream: StreamSpec,
    pub cursor: CursorSpec,
    pub fetch: FetchConfig,
    /// Route records through the batch queue instead of analyzing inline.
    pub batching: bool,
    pub queue: QueueConfig,
    pub llm: LlmConfig,
    pub analyzer: AnalyzerConfig,
    pub db_path: PathBuf,
}

impl AppConfig {
    /// Load from the process environment (after an optional `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let nats_url = env
            .raw("NATS_URL")
            .unwrap_or_else(|| DEFAULT_NATS_URL.to_string());

        let retention_hours: u64 = env.parse("RETENTION_HOURS", 24)?;
        let retention_secs = retention_hours
            .checked_mul(3600)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: env.key("RETENTION_HOURS"),
                message: format!("{retention_hours} hours is out of range"),
            })?;
        let storage: StorageMode = env.parse("STORAGE", StorageMode::File)?;
        let stream = StreamSpec::new(STREAM_NAME, SUBJECT_NAME)
            .with_storage(storage)
            .with_max_age(Duration::from_secs(retention_secs));

        let ack_wait_secs: u64 = env.parse("ACK_WAIT_SECS", 60)?;
        let cursor = CursorSpec::new(STREAM_NAME, CONSUMER_NAME, SUBJECT_NAME)
            .with_max_deliver(env.limit("MAX_DELIVER")?)
            .with_max_ack_pending(env.limit("MAX_ACK_PENDING")?)
            .with_ack_wait(Duration::from_secs(ack_wait_secs));

        let default_backoff = Backoff::default();
        let fetch = FetchConfig {
            batch: env.parse("FETCH_BATCH", 1usize)?.max(1),
            wait: Duration::from_millis(env.parse("FETCH_WAIT_MS", 1000u64)?),
            backoff: Backoff {
                base: Duration::from_millis(
                    env.parse("FETCH_BACKOFF_MS", default_backoff.base.as_millis() as u64)?,
                ),
                max: Duration::from_millis(
                    env.parse("FETCH_BACKOFF_MAX_MS", default_backoff.max.as_millis() as u64)?,
                ),
            },
        };

        let batching = env.flag("BATCHING", true)?;
        let queue = QueueConfig {
            capacity: env.parse("QUEUE_SIZE", 100usize)?,
            batch_size: env.parse("BATCH_SIZE", 10usize)?,
            flush_interval: Duration::from_millis(env.parse("FLUSH_INTERVAL_MS", 1000u64)?),
        };
        queue.validate()?;

        let backend: LlmBackend = env.parse("PROVIDER", LlmBackend::Anthropic)?;
        let api_key = env
            .get("API_KEY")
            .or_else(|| backend.api_key_var().and_then(|var| env.raw(var)));
        if api_key.is_none() {
            if let Some(var) = backend.api_key_var() {
                return Err(ConfigError::MissingRequired {
                    key: env.key("API_KEY"),
                    hint: format!(
                        "Set {} or {var} for the {} provider.",
                        env.key("API_KEY"),
                        backend.label()
                    ),
                });
            }
        }
        let model = env
            .get("MODEL")
            .unwrap_or_else(|| backend.default_model().to_string());
        let llm = LlmConfig {
            backend,
            api_key: api_key.map(SecretString::from),
            model,
            base_url: env.get("BASE_URL"),
        };

        let analyzer = AnalyzerConfig {
            agent_name: env
                .get("AGENT_NAME")
                .unwrap_or_else(|| DEFAULT_AGENT_NAME.to_string()),
            instructions: env
                .get("INSTRUCTIONS")
                .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string()),
            ..AnalyzerConfig::default()
        };

        let db_path = PathBuf::from(
            env.get("DB_PATH")
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
        );

        Ok(Self {
            nats_url,
            stream,
            cursor,
            fetch,
            batching,
            queue,
            llm,
            analyzer,
            db_path,
        })
    }
}

// ── Lookup helpers ──────────────────────────────────────────────────

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn key(&self, name: &str) -> String {
        format!("{PREFIX}{name}")
    }

    /// Unprefixed variable.
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// `LOG_ANALYST_`-prefixed variable.
    fn get(&self, name: &str) -> Option<String> {
        self.raw(&self.key(name))
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(name) {
            Some(v) => parse_value(&self.key(name), &v),
            None => Ok(default),
        }
    }

    /// Optional positive cap. `unlimited` or any value <= 0 means no cap.
    fn limit(&self, name: &str) -> Result<Option<i64>, ConfigError> {
        match self.get(name) {
            None => Ok(None),
            Some(v) if v.eq_ignore_ascii_case("unlimited") => Ok(None),
            Some(v) => {
                let n: i64 = parse_value(&self.key(name), &v)?;
                Ok((n > 0).then_some(n))
            }
        }
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(name).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => Err(ConfigError::InvalidValue {
                    key: self.key(name),
                    message: format!("expected true or false, got '{other}'"),
                }),
            },
        }
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{value}': {e}"),
    })
}
