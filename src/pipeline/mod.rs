//! Durable, batched ingestion pipeline.
//!
//! Records flow through:
//! 1. `StreamProvisioner` ensures the stream and durable cursor at startup
//! 2. `PullConsumer` fetches bounded batches and dispatches each record
//! 3. `QueueHandler` → `BatchQueue` batch records by size or time
//! 4. `AckOnSuccess<LogAnalyzer>` analyzes, stores and replies, then acks
//!
//! **A record is acknowledged only after its handling succeeded.** Anything
//! that fails is nakked and comes back from the broker.

pub mod analyzer;
pub mod consumer;
pub mod handlers;
pub mod provisioner;
pub mod queue;
pub mod types;

pub use analyzer::{AnalysisOutcome, AnalyzerConfig, LogAnalyzer};
pub use consumer::{Backoff, ConsumerStats, FetchConfig, PullConsumer};
pub use handlers::{AckOnSuccess, AnalysisHandler, QueueHandler};
pub use provisioner::StreamProvisioner;
pub use queue::{BatchQueue, FlushFailure, QueueConfig, QueueStats};
pub use types::{Batch, BatchProcessor, Disposition, FlushTrigger, LogMessage, RecordHandler};
