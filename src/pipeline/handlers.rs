//! Record handlers for the pull-consumer loop, and the ack layer that sits
//! between the batch queue and the analyzer.
//!
//! Two wirings:
//! - direct: `AnalysisHandler` analyzes each record inline and the loop acks it
//! - queued: `QueueHandler` hands the record to the batch queue; the queue
//!   flushes into `AckOnSuccess<LogAnalyzer>`, which acks the whole batch
//!   once the analyzer succeeds

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::Record;
use crate::error::PipelineError;
use crate::pipeline::analyzer::LogAnalyzer;
use crate::pipeline::queue::BatchQueue;
use crate::pipeline::types::{Batch, BatchProcessor, Disposition, RecordHandler};

/// Analyze each record inline.
pub struct AnalysisHandler {
    analyzer: Arc<LogAnalyzer>,
}

impl AnalysisHandler {
    pub fn new(analyzer: Arc<LogAnalyzer>) -> Self {
        Self { analyzer }
    }
}

#[async_trait]
impl RecordHandler for AnalysisHandler {
    async fn handle(&self, record: &Record) -> Result<Disposition, PipelineError> {
        let outcome = self.analyzer.analyze_record(record).await?;
        debug!(sequence = record.sequence(), ?outcome, "Record handled");
        Ok(Disposition::Processed)
    }
}

/// Hand each record to the batch queue. The record is acknowledged later,
/// by whatever processes its batch.
pub struct QueueHandler {
    queue: Arc<BatchQueue<Record>>,
}

impl QueueHandler {
    pub fn new(queue: Arc<BatchQueue<Record>>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl RecordHandler for QueueHandler {
    async fn handle(&self, record: &Record) -> Result<Disposition, PipelineError> {
        self.queue.enqueue(record.clone()).await?;
        Ok(Disposition::Deferred)
    }
}

/// Acks every record of a batch after the inner processor succeeds; naks
/// them after it fails so the broker redelivers.
pub struct AckOnSuccess<P> {
    inner: P,
}

impl<P> AckOnSuccess<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<P> BatchProcessor<Record> for AckOnSuccess<P>
where
    P: BatchProcessor<Record>,
{
    async fn process_batch(
        &self,
        batch: &Batch<Record>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        match self.inner.process_batch(batch, cancel).await {
            Ok(()) => {
                for record in &batch.items {
                    if let Err(e) = record.ack().await {
                        // Redelivered after the ack wait; the analyzer skips it.
                        warn!(sequence = record.sequence(), error = %e, "Ack failed");
                    }
                }
                Ok(())
            }
            Err(e) => {
                for record in batch.items.iter().filter(|r| !r.is_acked()) {
                    if let Err(nak_err) = record.nak().await {
                        warn!(sequence = record.sequence(), error = %nak_err, "Nak failed");
                    }
                }
                Err(e)
            }
        }
    }
}
