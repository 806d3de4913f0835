//! Durable pull-consumer loop.
//!
//! Flow per iteration:
//! 1. Fetch up to `batch` records from the cursor, waiting at most `wait`
//! 2. Nothing arrived (or the fetch timed out) → loop again
//! 3. Transport error → log, back off, loop again
//! 4. Dispatch each record to the handler in fetch order:
//!    `Processed` → ack, `Deferred` → leave it, error → nak
//!
//! The loop runs until its cancellation token fires. A fetch still waiting
//! is abandoned; records already fetched are dispatched before it returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Cursor, CursorSpec, LogBroker, Record};
use crate::error::BrokerError;
use crate::pipeline::types::{Disposition, RecordHandler};

/// Capped exponential backoff after consecutive fetch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failure. Zero disables backoff entirely.
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    pub fn disabled() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Delay before retrying after `failures` consecutive failures (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        if self.base.is_zero() || failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max.max(self.base))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchConfig {
    /// Records requested per fetch.
    pub batch: usize,
    /// Longest a single fetch waits for records.
    pub wait: Duration,
    pub backoff: Backoff,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            batch: 1,
            wait: Duration::from_secs(1),
            backoff: Backoff::default(),
        }
    }
}

/// Counters returned when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub fetched: u64,
    pub acked: u64,
    pub deferred: u64,
    pub failed: u64,
    pub fetch_errors: u64,
}

pub struct PullConsumer {
    cursor: Arc<dyn Cursor>,
    handler: Arc<dyn RecordHandler>,
    config: FetchConfig,
}

impl PullConsumer {
    pub fn new(
        cursor: Arc<dyn Cursor>,
        handler: Arc<dyn RecordHandler>,
        config: FetchConfig,
    ) -> Self {
        Self {
            cursor,
            handler,
            config,
        }
    }

    /// Ensure the durable cursor exists and build a consumer on it.
    pub async fn bind(
        broker: &dyn LogBroker,
        spec: &CursorSpec,
        handler: Arc<dyn RecordHandler>,
        config: FetchConfig,
    ) -> Result<Self, BrokerError> {
        let (_, cursor) = broker.ensure_cursor(spec).await?;
        Ok(Self::new(cursor, handler, config))
    }

    /// Run the loop on a background task.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<ConsumerStats> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(&self, cancel: CancellationToken) -> ConsumerStats {
        let name = self.cursor.name().to_string();
        let mut stats = ConsumerStats::default();
        let mut consecutive_errors: u32 = 0;

        info!(
            consumer = %name,
            batch = self.config.batch,
            wait_ms = self.config.wait.as_millis() as u64,
            "Pull consumer started"
        );

        loop {
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.cursor.fetch(self.config.batch, self.config.wait) => result,
            };

            match fetched {
                Ok(records) => {
                    consecutive_errors = 0;
                    if records.is_empty() {
                        continue;
                    }
                    stats.fetched += records.len() as u64;
                    debug!(consumer = %name, count = records.len(), "Dispatching records");
                    for record in &records {
                        self.dispatch(record, &mut stats).await;
                    }
                }
                Err(e) if e.is_timeout() => {
                    consecutive_errors = 0;
                }
                Err(e) => {
                    stats.fetch_errors += 1;
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let delay = self.config.backoff.delay(consecutive_errors);
                    warn!(
                        consumer = %name,
                        error = %e,
                        attempt = consecutive_errors,
                        retry_in_ms = delay.as_millis() as u64,
                        "Fetch failed"
                    );
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        info!(
            consumer = %name,
            fetched = stats.fetched,
            acked = stats.acked,
            deferred = stats.deferred,
            failed = stats.failed,
            fetch_errors = stats.fetch_errors,
            "Pull consumer stopped"
        );
        stats
    }

    async fn dispatch(&self, record: &Record, stats: &mut ConsumerStats) {
        match self.handler.handle(record).await {
            Ok(Disposition::Processed) => match record.ack().await {
                Ok(()) => stats.acked += 1,
                Err(e) => {
                    // Unacked records come back after the ack wait.
                    warn!(sequence = record.sequence(), error = %e, "Ack failed");
                }
            },
            Ok(Disposition::Deferred) => stats.deferred += 1,
            Err(e) => {
                stats.failed += 1;
                error!(
                    sequence = record.sequence(),
                    delivered = record.delivered(),
                    error = %e,
                    "Handler failed, requesting redelivery"
                );
                if let Err(e) = record.nak().await {
                    warn!(sequence = record.sequence(), error = %e, "Nak failed");
                }
            }
        }
    }
}
