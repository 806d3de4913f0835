//! Bounded batch queue.
//!
//! Producers call [`BatchQueue::enqueue`]; a single worker task owns the open
//! batch and flushes it to the [`BatchProcessor`] when it reaches
//! `batch_size` items or when the flush interval ticks, whichever comes
//! first. A full buffer delays the producer instead of dropping the item.
//!
//! Flush failures are logged, counted and broadcast on [`BatchQueue::errors`].
//! The queue never retries or re-enqueues a failed batch; redelivery is the
//! job of the acknowledgment layer around the processor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ConfigError, QueueError};
use crate::pipeline::types::{Batch, BatchProcessor, FlushTrigger};

/// Buffered failure notifications kept for slow subscribers.
const FAILURE_CHANNEL_CAPACITY: usize = 64;

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum items admitted but not yet taken by the worker.
    pub capacity: usize,
    /// Flush as soon as the open batch holds this many items.
    pub batch_size: usize,
    /// Flush a non-empty batch at least this often. Also the admission
    /// delay a producer pays when the buffer is full.
    pub flush_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            batch_size: 10,
            flush_interval: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };
        if self.capacity == 0 {
            return Err(invalid("queue_size", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if self.flush_interval.is_zero() {
            return Err(invalid("flush_interval", "must be greater than zero"));
        }
        Ok(())
    }
}

// ── Stats and failures ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Batches the processor accepted.
    pub batches_flushed: u64,
    /// Items in those batches.
    pub items_flushed: u64,
    /// Batches the processor rejected.
    pub failed_batches: u64,
}

/// Broadcast whenever the processor rejects a batch.
#[derive(Debug, Clone)]
pub struct FlushFailure {
    pub batch_id: Uuid,
    pub size: usize,
    pub trigger: FlushTrigger,
    pub reason: String,
}

#[derive(Default)]
struct Counters {
    batches_flushed: AtomicU64,
    items_flushed: AtomicU64,
    failed_batches: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            items_flushed: self.items_flushed.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
        }
    }
}

// ── Queue ───────────────────────────────────────────────────────────

enum WorkerState<T> {
    /// Not running; the receiver waits here so admitted items survive a
    /// stop/start cycle.
    Idle(mpsc::Receiver<T>),
    Running {
        stop: CancellationToken,
        handle: JoinHandle<WorkerExit<T>>,
    },
    /// The worker panicked and took the receiver with it.
    Poisoned,
}

struct WorkerExit<T> {
    rx: mpsc::Receiver<T>,
    drain: Result<(), String>,
}

pub struct BatchQueue<T> {
    config: QueueConfig,
    processor: Arc<dyn BatchProcessor<T>>,
    tx: mpsc::Sender<T>,
    state: Mutex<WorkerState<T>>,
    counters: Arc<Counters>,
    failures: broadcast::Sender<FlushFailure>,
}

impl<T: Send + Sync + 'static> BatchQueue<T> {
    pub fn new(
        config: QueueConfig,
        processor: Arc<dyn BatchProcessor<T>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.capacity);
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            processor,
            tx,
            state: Mutex::new(WorkerState::Idle(rx)),
            counters: Arc::new(Counters::default()),
            failures,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Spawn the worker. No-op if it is already running.
    pub async fn start(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, WorkerState::Poisoned) {
            WorkerState::Idle(rx) => {
                let stop = CancellationToken::new();
                let worker = Worker {
                    config: self.config.clone(),
                    processor: Arc::clone(&self.processor),
                    counters: Arc::clone(&self.counters),
                    failures: self.failures.clone(),
                    stop: stop.clone(),
                };
                let handle = tokio::spawn(worker.run(rx));
                *state = WorkerState::Running { stop, handle };
                info!(
                    capacity = self.config.capacity,
                    batch_size = self.config.batch_size,
                    flush_interval_ms = self.config.flush_interval.as_millis() as u64,
                    "Batch queue started"
                );
                Ok(())
            }
            running @ WorkerState::Running { .. } => {
                *state = running;
                debug!("Batch queue already running");
                Ok(())
            }
            WorkerState::Poisoned => Err(QueueError::Closed),
        }
    }

    /// Admit one item.
    ///
    /// When the buffer is full the caller waits one flush interval and then
    /// blocks until there is room. Items admitted while the queue is stopped
    /// stay buffered until the next start.
    pub async fn enqueue(&self, item: T) -> Result<(), QueueError> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
            Err(TrySendError::Full(item)) => {
                warn!(
                    capacity = self.config.capacity,
                    delay_ms = self.config.flush_interval.as_millis() as u64,
                    "Batch queue full, delaying admission"
                );
                tokio::time::sleep(self.config.flush_interval).await;
                self.tx.send(item).await.map_err(|_| QueueError::Closed)
            }
        }
    }

    /// Stop the worker after it drains and flushes everything admitted.
    ///
    /// Waits for the worker to exit. No-op if not running. A failed final
    /// flush is returned as [`QueueError::FinalFlush`].
    pub async fn stop(&self) -> Result<QueueStats, QueueError> {
        let mut state = self.state.lock().await;
        let (stop, handle) = match std::mem::replace(&mut *state, WorkerState::Poisoned) {
            WorkerState::Running { stop, handle } => (stop, handle),
            other => {
                *state = other;
                return Ok(self.stats());
            }
        };

        stop.cancel();
        let exit = handle.await.map_err(|e| QueueError::Worker(e.to_string()))?;
        *state = WorkerState::Idle(exit.rx);

        let stats = self.stats();
        info!(
            batches = stats.batches_flushed,
            items = stats.items_flushed,
            failed = stats.failed_batches,
            "Batch queue stopped"
        );
        exit.drain.map_err(QueueError::FinalFlush)?;
        Ok(stats)
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, WorkerState::Running { .. })
    }

    /// Subscribe to flush failures.
    pub fn errors(&self) -> broadcast::Receiver<FlushFailure> {
        self.failures.subscribe()
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }
}

// ── Worker ──────────────────────────────────────────────────────────

struct Worker<T> {
    config: QueueConfig,
    processor: Arc<dyn BatchProcessor<T>>,
    counters: Arc<Counters>,
    failures: broadcast::Sender<FlushFailure>,
    stop: CancellationToken,
}

impl<T: Send + Sync + 'static> Worker<T> {
    async fn run(self, mut rx: mpsc::Receiver<T>) -> WorkerExit<T> {
        let interval = self.config.flush_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut open: Vec<T> = Vec::with_capacity(self.config.batch_size);
        let mut opened_at = Instant::now();
        // Flushes never see the stop signal; a started batch runs to completion.
        let flush_token = CancellationToken::new();

        loop {
            tokio::select! {
                biased;

                _ = self.stop.cancelled() => break,

                _ = ticker.tick() => {
                    if !open.is_empty() {
                        let items = std::mem::take(&mut open);
                        let _ = self
                            .flush(items, opened_at, FlushTrigger::Interval, &flush_token)
                            .await;
                    }
                }

                item = rx.recv() => {
                    // `None` only once every sender is gone, i.e. the queue was dropped.
                    let Some(item) = item else { break };
                    if open.is_empty() {
                        opened_at = Instant::now();
                    }
                    open.push(item);
                    if open.len() >= self.config.batch_size {
                        let items = std::mem::take(&mut open);
                        let _ = self
                            .flush(items, opened_at, FlushTrigger::Size, &flush_token)
                            .await;
                    }
                }
            }
        }

        // Drain: everything already admitted goes out, still in size-bounded batches.
        let mut drain = Ok(());
        while let Ok(item) = rx.try_recv() {
            if open.is_empty() {
                opened_at = Instant::now();
            }
            open.push(item);
            if open.len() >= self.config.batch_size {
                let items = std::mem::take(&mut open);
                let result = self.flush(items, opened_at, FlushTrigger::Drain, &flush_token).await;
                if drain.is_ok() {
                    drain = result;
                }
            }
        }
        if !open.is_empty() {
            let result = self.flush(open, opened_at, FlushTrigger::Drain, &flush_token).await;
            if drain.is_ok() {
                drain = result;
            }
        }

        debug!("Batch queue worker exited");
        WorkerExit { rx, drain }
    }

    async fn flush(
        &self,
        items: Vec<T>,
        opened_at: Instant,
        trigger: FlushTrigger,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        let batch = Batch::new(items, opened_at, trigger);
        let size = batch.len();
        debug!(
            batch_id = %batch.id,
            size,
            trigger = %trigger,
            age_ms = opened_at.elapsed().as_millis() as u64,
            "Flushing batch"
        );

        match self.processor.process_batch(&batch, cancel).await {
            Ok(()) => {
                self.counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .items_flushed
                    .fetch_add(size as u64, Ordering::Relaxed);
                info!(batch_id = %batch.id, size, trigger = %trigger, "Batch flushed");
                Ok(())
            }
            Err(e) => {
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                error!(batch_id = %batch.id, size, trigger = %trigger, error = %e, "Batch flush failed");
                let reason = e.to_string();
                // No subscribers is fine.
                let _ = self.failures.send(FlushFailure {
                    batch_id: batch.id,
                    size,
                    trigger,
                    reason: reason.clone(),
                });
                Err(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

    /// Records every batch it sees and reports it on a channel.
    struct RecordingProcessor {
        seen: UnboundedSender<(Vec<u32>, FlushTrigger)>,
        fail: AtomicBool,
        delay: Duration,
    }

    impl RecordingProcessor {
        fn new() -> (Arc<Self>, UnboundedReceiver<(Vec<u32>, FlushTrigger)>) {
            let (seen, rx) = unbounded_channel();
            let processor = Self {
                seen,
                fail: AtomicBool::new(false),
                delay: Duration::ZERO,
            };
            (Arc::new(processor), rx)
        }

        fn failing() -> (Arc<Self>, UnboundedReceiver<(Vec<u32>, FlushTrigger)>) {
            let (processor, rx) = Self::new();
            processor.fail.store(true, Ordering::SeqCst);
            (processor, rx)
        }

        fn slow(delay: Duration) -> (Arc<Self>, UnboundedReceiver<(Vec<u32>, FlushTrigger)>) {
            let (seen, rx) = unbounded_channel();
            let processor = Self {
                seen,
                fail: AtomicBool::new(false),
                delay,
            };
            (Arc::new(processor), rx)
        }
    }

    #[async_trait]
    impl BatchProcessor<u32> for RecordingProcessor {
        async fn process_batch(
            &self,
            batch: &Batch<u32>,
            _cancel: &CancellationToken,
        ) -> Result<(), PipelineError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let _ = self.seen.send((batch.items.clone(), batch.trigger));
            if self.fail.load(Ordering::SeqCst) {
                return Err(PipelineError::Analysis("processor refused".into()));
            }
            Ok(())
        }
    }

    /// Takes `per_item` for each item and gives up on the rest of the batch
    /// once its token is cancelled.
    struct ItemwiseProcessor {
        seen: UnboundedSender<(Vec<u32>, FlushTrigger)>,
        per_item: Duration,
    }

    #[async_trait]
    impl BatchProcessor<u32> for ItemwiseProcessor {
        async fn process_batch(
            &self,
            batch: &Batch<u32>,
            cancel: &CancellationToken,
        ) -> Result<(), PipelineError> {
            let mut done = Vec::new();
            for item in &batch.items {
                if cancel.is_cancelled() {
                    let _ = self.seen.send((done, batch.trigger));
                    return Err(PipelineError::Analysis("cancelled mid-batch".into()));
                }
                tokio::time::sleep(self.per_item).await;
                done.push(*item);
            }
            let _ = self.seen.send((done, batch.trigger));
            Ok(())
        }
    }

    fn config(capacity: usize, batch_size: usize, flush_ms: u64) -> QueueConfig {
        QueueConfig {
            capacity,
            batch_size,
            flush_interval: Duration::from_millis(flush_ms),
        }
    }

    fn drain_seen(rx: &mut UnboundedReceiver<(Vec<u32>, FlushTrigger)>) -> Vec<(Vec<u32>, FlushTrigger)> {
        let mut out = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            out.push(entry);
        }
        out
    }

    #[test]
    fn config_rejects_zero_values() {
        assert!(QueueConfig::default().validate().is_ok());
        assert!(config(0, 1, 10).validate().is_err());
        assert!(config(1, 0, 10).validate().is_err());
        assert!(config(1, 1, 0).validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn size_trigger_flushes_exactly_batch_size() {
        let (processor, mut seen) = RecordingProcessor::new();
        let queue = BatchQueue::new(config(10, 3, 3_600_000), processor).unwrap();
        queue.start().await.unwrap();

        for i in 1..=3 {
            queue.enqueue(i).await.unwrap();
        }

        let (items, trigger) = seen.recv().await.unwrap();
        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(trigger, FlushTrigger::Size);
        assert_eq!(queue.stats().batches_flushed, 1);

        queue.stop().await.unwrap();
        assert!(drain_seen(&mut seen).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn time_trigger_flushes_partial_batch() {
        let (processor, mut seen) = RecordingProcessor::new();
        let queue = BatchQueue::new(config(10, 10, 1_000), processor).unwrap();
        queue.start().await.unwrap();

        let started = Instant::now();
        queue.enqueue(42).await.unwrap();

        let (items, trigger) = seen.recv().await.unwrap();
        assert_eq!(items, vec![42]);
        assert_eq!(trigger, FlushTrigger::Interval);
        assert!(started.elapsed() <= Duration::from_millis(1_000));

        queue.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drains_partial_batch_before_returning() {
        let (processor, mut seen) = RecordingProcessor::new();
        let queue = BatchQueue::new(config(10, 10, 3_600_000), processor).unwrap();
        queue.start().await.unwrap();

        for i in 0..4 {
            queue.enqueue(i).await.unwrap();
        }
        let stats = queue.stop().await.unwrap();

        assert_eq!(stats.batches_flushed, 1);
        assert_eq!(stats.items_flushed, 4);
        let batches = drain_seen(&mut seen);
        assert_eq!(batches, vec![(vec![0, 1, 2, 3], FlushTrigger::Drain)]);
        assert!(!queue.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_a_running_flush_finish_every_item() {
        let (tx, mut seen) = unbounded_channel();
        let processor = Arc::new(ItemwiseProcessor {
            seen: tx,
            per_item: Duration::from_millis(100),
        });
        let queue = BatchQueue::new(config(10, 3, 3_600_000), processor).unwrap();
        queue.start().await.unwrap();

        for i in 0..3 {
            queue.enqueue(i).await.unwrap();
        }
        // The size flush is now partway through its first item.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = queue.stop().await.unwrap();

        assert_eq!(stats.failed_batches, 0);
        assert_eq!(stats.batches_flushed, 1);
        assert_eq!(stats.items_flushed, 3);
        assert_eq!(drain_seen(&mut seen), vec![(vec![0, 1, 2], FlushTrigger::Size)]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_item_is_lost_when_capacity_is_smaller_than_input() {
        let (processor, mut seen) = RecordingProcessor::slow(Duration::from_millis(50));
        let queue = BatchQueue::new(config(2, 3, 100), processor).unwrap();
        queue.start().await.unwrap();

        for i in 0..20 {
            queue.enqueue(i).await.unwrap();
        }
        queue.stop().await.unwrap();

        let batches = drain_seen(&mut seen);
        assert!(batches.iter().all(|(items, _)| items.len() <= 3));
        let flat: Vec<u32> = batches.into_iter().flat_map(|(items, _)| items).collect();
        assert_eq!(flat, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn full_buffer_delays_admission_instead_of_dropping() {
        let (processor, mut seen) = RecordingProcessor::new();
        let queue = Arc::new(BatchQueue::new(config(1, 10, 500), processor).unwrap());

        // Not started yet: the single slot fills up.
        queue.enqueue(1).await.unwrap();

        let started = Instant::now();
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(2).await })
        };
        queue.start().await.unwrap();
        producer.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));

        queue.stop().await.unwrap();
        let flat: Vec<u32> = drain_seen(&mut seen)
            .into_iter()
            .flat_map(|(items, _)| items)
            .collect();
        assert_eq!(flat, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_failure_is_broadcast_and_not_retried() {
        let (processor, mut seen) = RecordingProcessor::failing();
        let queue = BatchQueue::new(config(10, 2, 3_600_000), processor).unwrap();
        let mut errors = queue.errors();
        queue.start().await.unwrap();

        queue.enqueue(1).await.unwrap();
        queue.enqueue(2).await.unwrap();

        let failure = errors.recv().await.unwrap();
        assert_eq!(failure.size, 2);
        assert_eq!(failure.trigger, FlushTrigger::Size);
        assert!(failure.reason.contains("processor refused"));

        // Nothing left to drain, so stop succeeds and the batch was seen once.
        let stats = queue.stop().await.unwrap();
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.batches_flushed, 0);
        assert_eq!(drain_seen(&mut seen).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn final_flush_failure_is_returned_from_stop() {
        let (processor, _seen) = RecordingProcessor::failing();
        let queue = BatchQueue::new(config(10, 10, 3_600_000), processor).unwrap();
        queue.start().await.unwrap();
        queue.enqueue(7).await.unwrap();

        let result = queue.stop().await;
        assert!(matches!(result, Err(QueueError::FinalFlush(_))));
        // The queue is still usable afterwards.
        assert!(!queue.is_running().await);
        queue.start().await.unwrap();
        assert!(queue.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent_and_restartable() {
        let (processor, mut seen) = RecordingProcessor::new();
        let queue = BatchQueue::new(config(10, 10, 3_600_000), processor).unwrap();

        // Stop before start is a no-op.
        assert_eq!(queue.stop().await.unwrap(), QueueStats::default());

        queue.start().await.unwrap();
        queue.start().await.unwrap();
        assert!(queue.is_running().await);
        queue.stop().await.unwrap();
        queue.stop().await.unwrap();

        // Admitted while stopped, flushed after the restart.
        queue.enqueue(5).await.unwrap();
        queue.start().await.unwrap();
        queue.stop().await.unwrap();

        assert_eq!(drain_seen(&mut seen), vec![(vec![5], FlushTrigger::Drain)]);
    }
}
