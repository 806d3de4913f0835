//! Error types for the log analyst.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by the persistent log broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Failed to connect to broker at {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Failed to create stream {stream}: {reason}")]
    StreamCreate { stream: String, reason: String },

    #[error("Stream {stream} not found")]
    StreamNotFound { stream: String },

    #[error("Failed to create consumer {consumer} on stream {stream}: {reason}")]
    ConsumerCreate {
        stream: String,
        consumer: String,
        reason: String,
    },

    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Fetch failed on consumer {consumer}: {reason}")]
    Fetch { consumer: String, reason: String },

    #[error("Acknowledgment failed for sequence {sequence}: {reason}")]
    Ack { sequence: u64, reason: String },

    #[error("Record with sequence {sequence} was already acknowledged")]
    AlreadyAcknowledged { sequence: u64 },

    #[error("Failed to publish to {subject}: {reason}")]
    Publish { subject: String, reason: String },
}

impl BrokerError {
    /// Whether this error is the expected "nothing arrived in time" outcome.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Handler failed for sequence {sequence}: {reason}")]
    Handler { sequence: u64, reason: String },

    #[error("Analysis failed: {0}")]
    Analysis(String),

    #[error("Batch {batch_id} failed: {failed} of {total} records not processed")]
    Batch {
        batch_id: uuid::Uuid,
        failed: usize,
        total: usize,
    },

    #[error("Storage failed: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Batch queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is closed; record was not admitted")]
    Closed,

    #[error("Final flush failed: {0}")]
    FinalFlush(String),

    #[error("Queue worker terminated abnormally: {0}")]
    Worker(String),
}
