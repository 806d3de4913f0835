//! `LogStore` trait: the relational hand-off point for analyzed records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;

/// A persisted, analyzed log record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: String,
    pub hostname: String,
    pub severity: String,
    pub service: String,
    pub message: String,
    /// Context object as JSON text.
    pub context: Option<String>,
    pub analysis: Option<String>,
    /// Broker sequence the entry came from, when it came from the stream.
    pub stream_sequence: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to insert a new entry.
#[derive(Debug, Clone, Default)]
pub struct NewLogEntry {
    pub timestamp: String,
    pub hostname: String,
    pub severity: String,
    pub service: String,
    pub message: String,
    pub context: Option<String>,
    pub analysis: Option<String>,
    pub stream_sequence: Option<u64>,
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Insert an entry and return its row id.
    async fn insert_log_entry(&self, entry: &NewLogEntry) -> Result<i64, DatabaseError>;

    /// Newest entries first (by event timestamp), optionally filtered by severity.
    async fn get_log_entries(
        &self,
        limit: usize,
        severity: Option<&str>,
    ) -> Result<Vec<LogEntry>, DatabaseError>;

    /// Whether an entry from this stream sequence is already stored.
    async fn has_stream_sequence(&self, sequence: u64) -> Result<bool, DatabaseError>;

    async fn count_log_entries(&self) -> Result<u64, DatabaseError>;
}
