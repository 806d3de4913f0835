//! Shared types for the ingestion pipeline.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::Record;
use crate::error::PipelineError;

// ── Log message ─────────────────────────────────────────────────────

/// A structured log line published by a monitored service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    /// When the event happened, as sent by the producer.
    pub timestamp: String,
    pub hostname: String,
    /// Free-form level: "info", "warning", "error", "critical", ...
    pub severity: String,
    pub service: String,
    pub message: String,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl LogMessage {
    /// Decode a record payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

// ── Handler ─────────────────────────────────────────────────────────

/// What the consumer loop should do with a record after its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled; the loop acknowledges it.
    Processed,
    /// Ownership moved downstream (e.g. into the batch queue), which
    /// acknowledges it later. The loop leaves it alone.
    Deferred,
}

/// Per-record handler invoked by the pull-consumer loop, in fetch order.
///
/// An error leaves the record unacknowledged and asks for redelivery.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &Record) -> Result<Disposition, PipelineError>;
}

// ── Batches ─────────────────────────────────────────────────────────

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The batch reached the size threshold.
    Size,
    /// The periodic flush interval elapsed.
    Interval,
    /// The queue is stopping and drains what it holds.
    Drain,
}

impl FlushTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Interval => "interval",
            Self::Drain => "drain",
        }
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Ordered, bounded group of items handed to a processor as one unit.
#[derive(Debug, Clone)]
pub struct Batch<T> {
    pub id: Uuid,
    /// Items in arrival order.
    pub items: Vec<T>,
    pub opened_at: Instant,
    pub trigger: FlushTrigger,
}

impl<T> Batch<T> {
    pub fn new(items: Vec<T>, opened_at: Instant, trigger: FlushTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            items,
            opened_at,
            trigger,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Processes a whole batch and reports success or failure.
///
/// Must be safe to call repeatedly; a failure never corrupts queue state.
/// The token fires when the owner wants the processor to wind down early.
#[async_trait]
pub trait BatchProcessor<T>: Send + Sync {
    async fn process_batch(
        &self,
        batch: &Batch<T>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_message_decodes_with_context() {
        let payload = br#"{
            "timestamp": "2025-01-01T00:00:00Z",
            "hostname": "web-1",
            "severity": "error",
            "service": "checkout",
            "message": "payment gateway timeout",
            "context": {"region": "eu-west-1", "latency_ms": 5021}
        }"#;
        let msg = LogMessage::from_payload(payload).unwrap();
        assert_eq!(msg.hostname, "web-1");
        assert_eq!(msg.context["latency_ms"], 5021);
    }

    #[test]
    fn log_message_context_is_optional() {
        let payload = br#"{"timestamp":"t","hostname":"h","severity":"info","service":"s","message":"m"}"#;
        let msg = LogMessage::from_payload(payload).unwrap();
        assert!(msg.context.is_empty());
    }

    #[test]
    fn log_message_rejects_garbage() {
        assert!(LogMessage::from_payload(b"not json").is_err());
        assert!(LogMessage::from_payload(br#"{"hostname":"h"}"#).is_err());
    }

    #[test]
    fn batch_gets_unique_ids() {
        let now = Instant::now();
        let a = Batch::new(vec![1], now, FlushTrigger::Size);
        let b = Batch::new(vec![1], now, FlushTrigger::Size);
        assert_ne!(a.id, b.id);
        assert_eq!(a.len(), 1);
        assert_eq!(FlushTrigger::Drain.to_string(), "drain");
    }
}
