//! Batch Processor - background drain-and-export loop for one buffer
//!
//! Each [`BatchProcessor`] owns one tokio task that drains its
//! [`BoundedBuffer`] and hands batches to an exporter. A cycle starts when
//!
//! - `export_interval` has elapsed since the previous cycle, or
//! - the buffer reached its high watermark, or
//! - a caller asked for [`force_flush`](BatchProcessor::force_flush),
//!
//! whichever happens first. The export is awaited on the task itself, so a
//! shutdown signal that arrives mid-export is only observed once that export
//! has finished.
//!
//! # State machine
//!
//! ```text
//! Idle ──▶ Draining ──▶ Exporting ──▶ Idle
//!   │
//!   └──(shutdown)──▶ ShuttingDown ──▶ Flushing ──▶ Stopped
//! ```
//!
//! The current state is published on a `watch` channel; see
//! [`BatchProcessor::subscribe`].

use crate::buffer::BoundedBuffer;
use crate::error::TimedOut;
use crate::exporter::SignalExporterBoxed;
use crate::invariants::debug_assert_returned_to_idle;
use crate::signal::{Batch, SignalKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for batch processing
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Longest time records wait before a timer-driven cycle
    pub export_interval: Duration,
    /// Maximum records per exported batch
    pub max_export_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            export_interval: Duration::from_secs(10),
            max_export_batch_size: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Waiting for the timer, the watermark, or a flush request
    Idle,
    /// Removing records from the buffer
    Draining,
    /// A batch is with the exporter
    Exporting,
    /// Shutdown received; the buffer is closed
    ShuttingDown,
    /// Final drain-and-export in progress
    Flushing,
    /// Task finished; nothing will be exported any more
    Stopped,
}

/// Thread-safe export counters, shared with the processor task
#[derive(Debug, Default)]
pub struct ExportMetrics {
    records_exported: AtomicU64,
    batches_exported: AtomicU64,
    batches_failed: AtomicU64,
    records_dropped: AtomicU64,
    flush_cycles: AtomicU64,
}

impl ExportMetrics {
    pub fn records_exported(&self) -> u64 {
        self.records_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn batches_failed(&self) -> u64 {
        self.batches_failed.load(Ordering::Relaxed)
    }

    /// Records discarded because their batch failed to export
    pub fn records_dropped(&self) -> u64 {
        self.records_dropped.load(Ordering::Relaxed)
    }

    /// Out-of-band cycles: force flushes plus the final shutdown flush
    pub fn flush_cycles(&self) -> u64 {
        self.flush_cycles.load(Ordering::Relaxed)
    }

    fn record_success(&self, record_count: u64) {
        self.records_exported.fetch_add(record_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, record_count: u64) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.records_dropped.fetch_add(record_count, Ordering::Relaxed);
    }
}

/// Handle to the background export task of one signal kind.
pub struct BatchProcessor {
    kind: SignalKind,
    buffer: Arc<BoundedBuffer>,
    state_rx: watch::Receiver<ProcessorState>,
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    metrics: Arc<ExportMetrics>,
}

impl BatchProcessor {
    /// Spawns the processor task for `buffer`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        buffer: Arc<BoundedBuffer>,
        exporter: Arc<dyn SignalExporterBoxed>,
        config: BatchConfig,
    ) -> Self {
        let kind = buffer.kind();
        let (state_tx, state_rx) = watch::channel(ProcessorState::Idle);
        let (flush_tx, flush_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let metrics = Arc::new(ExportMetrics::default());

        let worker = Worker {
            kind,
            buffer: Arc::clone(&buffer),
            exporter,
            config: BatchConfig {
                export_interval: config.export_interval.max(Duration::from_millis(1)),
                max_export_batch_size: config.max_export_batch_size.max(1),
            },
            state: state_tx,
            metrics: Arc::clone(&metrics),
        };
        tokio::spawn(worker.run(flush_rx, shutdown_rx));

        Self {
            kind,
            buffer,
            state_rx,
            flush_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            metrics,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn buffer(&self) -> &Arc<BoundedBuffer> {
        &self.buffer
    }

    pub fn state(&self) -> ProcessorState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ProcessorState> {
        self.state_rx.clone()
    }

    pub fn metrics(&self) -> &Arc<ExportMetrics> {
        &self.metrics
    }

    /// Drains and exports everything currently buffered.
    ///
    /// Returns once that cycle has finished, whatever the export outcome.
    /// The periodic timer keeps running. After shutdown this is a no-op.
    pub async fn force_flush(&self, timeout: Duration) -> Result<(), TimedOut> {
        let flush = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            if self.flush_tx.send(reply_tx).await.is_err() {
                return;
            }
            // A dropped reply means the task stopped, which implies a final flush.
            let _ = reply_rx.await;
        };

        tokio::time::timeout(timeout, flush)
            .await
            .map_err(|_| TimedOut { after: timeout })
    }

    /// Closes the buffer, exports what it still holds and stops the task.
    ///
    /// Only the first call starts the final flush; every call waits for the
    /// task to reach `Stopped`. On timeout the task keeps flushing and a later
    /// call can wait again.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), TimedOut> {
        let trigger = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = trigger {
            info!(kind = %self.kind, buffered = self.buffer.len(), "shutting down batch processor");
            self.buffer.close();
            let _ = tx.send(());
        }

        let mut state = self.state_rx.clone();
        let stopped = async move {
            // Err means the task is gone, which only happens after Stopped.
            let _ = state.wait_for(|s| *s == ProcessorState::Stopped).await;
        };

        tokio::time::timeout(timeout, stopped)
            .await
            .map_err(|_| TimedOut { after: timeout })
    }
}

struct Worker {
    kind: SignalKind,
    buffer: Arc<BoundedBuffer>,
    exporter: Arc<dyn SignalExporterBoxed>,
    config: BatchConfig,
    state: watch::Sender<ProcessorState>,
    metrics: Arc<ExportMetrics>,
}

impl Worker {
    async fn run(
        self,
        mut flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let period = self.config.export_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(kind = %self.kind, exporter = self.exporter.name(), "batch processor started");

        loop {
            tokio::select! {
                biased;

                // A dropped handle counts as shutdown too.
                _ = &mut shutdown_rx => break,

                Some(reply) = flush_rx.recv() => {
                    self.metrics.flush_cycles.fetch_add(1, Ordering::Relaxed);
                    self.run_cycle().await;
                    ticker.reset();
                    let _ = reply.send(());
                }

                () = self.buffer.watermark_reached() => {
                    self.run_cycle().await;
                    ticker.reset();
                }

                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }

        self.state.send_replace(ProcessorState::ShuttingDown);
        self.buffer.close();

        self.state.send_replace(ProcessorState::Flushing);
        self.metrics.flush_cycles.fetch_add(1, Ordering::Relaxed);
        let exported = self.export_pending(false).await;

        // Flush requests that raced with shutdown are covered by the final flush.
        flush_rx.close();
        while let Ok(reply) = flush_rx.try_recv() {
            let _ = reply.send(());
        }

        info!(
            kind = %self.kind,
            final_records = exported,
            records_exported = self.metrics.records_exported(),
            records_dropped = self.metrics.records_dropped(),
            "batch processor stopped"
        );
        self.state.send_replace(ProcessorState::Stopped);
    }

    /// One timer, watermark or flush driven cycle.
    async fn run_cycle(&self) {
        self.state.send_replace(ProcessorState::Draining);
        let exported = self.export_pending(true).await;
        self.state.send_replace(ProcessorState::Idle);

        debug_assert_returned_to_idle!(*self.state.borrow());
        if exported > 0 {
            debug!(kind = %self.kind, records = exported, "export cycle finished");
        }
    }

    /// Exports the records present when called, in batches of at most
    /// `max_export_batch_size`. Returns how many records were handed to the
    /// exporter.
    async fn export_pending(&self, publish_states: bool) -> usize {
        let mut remaining = self.buffer.len();
        let mut handed_over = 0;

        while remaining > 0 {
            let records = self
                .buffer
                .drain(remaining.min(self.config.max_export_batch_size));
            if records.is_empty() {
                break;
            }
            remaining = remaining.saturating_sub(records.len());
            handed_over += records.len();

            if publish_states {
                self.state.send_replace(ProcessorState::Exporting);
            }
            self.export(Batch::new(self.kind, records)).await;
            if publish_states && remaining > 0 {
                self.state.send_replace(ProcessorState::Draining);
            }
        }

        handed_over
    }

    async fn export(&self, batch: Batch) {
        let count = batch.len() as u64;
        match self.exporter.export_boxed(batch).await {
            Ok(()) => self.metrics.record_success(count),
            Err(e) => {
                self.metrics.record_failure(count);
                warn!(
                    kind = %self.kind,
                    exporter = self.exporter.name(),
                    records = count,
                    error = %e,
                    "dropping batch after failed export"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferConfig, OverflowPolicy};
    use crate::error::{EnqueueError, ExportError};
    use crate::exporter::{SignalExporter, TestExporter};
    use crate::signal::{LogRecord, Severity, SignalRecord};
    use tokio::sync::Semaphore;

    fn log(i: usize) -> SignalRecord {
        SignalRecord::Log(LogRecord::new(Severity::Info, format!("record {}", i)))
    }

    fn bodies(records: &[SignalRecord]) -> Vec<String> {
        records
            .iter()
            .map(|r| match r {
                SignalRecord::Log(l) => l.body.clone(),
                other => panic!("unexpected record {:?}", other),
            })
            .collect()
    }

    fn buffer(capacity: usize, high_watermark: usize) -> Arc<BoundedBuffer> {
        Arc::new(BoundedBuffer::new(
            SignalKind::Log,
            BufferConfig {
                capacity,
                overflow_policy: OverflowPolicy::DropOldest,
                block_timeout: Duration::from_millis(100),
                high_watermark,
            },
        ))
    }

    fn config(interval: Duration, batch: usize) -> BatchConfig {
        BatchConfig {
            export_interval: interval,
            max_export_batch_size: batch,
        }
    }

    /// Always fails with a non-retryable error.
    struct RejectingExporter;

    impl SignalExporter for RejectingExporter {
        async fn export(&self, _batch: Batch) -> Result<(), ExportError> {
            Err(ExportError::RetriesExhausted {
                attempts: 4,
                last_error: "collector unavailable".into(),
            })
        }

        fn name(&self) -> &str {
            "rejecting"
        }
    }

    /// Holds every export until the test adds a permit.
    struct GatedExporter {
        gate: Semaphore,
        inner: TestExporter,
    }

    impl SignalExporter for GatedExporter {
        async fn export(&self, batch: Batch) -> Result<(), ExportError> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| ExportError::Transport(e.to_string()))?;
            permit.forget();
            SignalExporter::export(&self.inner, batch).await
        }

        fn name(&self) -> &str {
            "gated"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_driven_export() {
        let buf = buffer(100, 100);
        let exporter = Arc::new(TestExporter::new());
        let processor = BatchProcessor::start(
            Arc::clone(&buf),
            exporter.clone(),
            config(Duration::from_millis(100), 50),
        );

        for i in 0..5 {
            buf.try_enqueue(log(i)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exporter.exported_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(exporter.exported_count(), 5);
        assert_eq!(processor.state(), ProcessorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watermark_triggers_early_export() {
        let buf = buffer(100, 4);
        let exporter = Arc::new(TestExporter::new());
        let processor = BatchProcessor::start(
            Arc::clone(&buf),
            exporter.clone(),
            config(Duration::from_secs(3600), 50),
        );

        for i in 0..3 {
            buf.try_enqueue(log(i)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(exporter.exported_count(), 0);

        buf.try_enqueue(log(3)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(exporter.exported_count(), 4);
        assert_eq!(processor.metrics().flush_cycles(), 0);
    }

    #[tokio::test]
    async fn test_force_flush_splits_into_bounded_batches() {
        let buf = buffer(100, 100);
        let exporter = Arc::new(TestExporter::new());
        let processor = BatchProcessor::start(
            Arc::clone(&buf),
            exporter.clone(),
            config(Duration::from_secs(3600), 3),
        );

        for i in 0..7 {
            buf.try_enqueue(log(i)).unwrap();
        }
        processor.force_flush(Duration::from_secs(5)).await.unwrap();

        assert_eq!(exporter.exported_count(), 7);
        assert_eq!(exporter.batch_count(), 3);
        assert_eq!(
            bodies(&exporter.all_records()),
            (0..7).map(|i| format!("record {}", i)).collect::<Vec<_>>()
        );
        assert_eq!(processor.metrics().batches_exported(), 3);
        assert_eq!(processor.metrics().flush_cycles(), 1);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_failed_export_drops_batch_and_returns_to_idle() {
        let buf = buffer(100, 100);
        let processor = BatchProcessor::start(
            Arc::clone(&buf),
            Arc::new(RejectingExporter),
            config(Duration::from_secs(3600), 10),
        );

        for i in 0..4 {
            buf.try_enqueue(log(i)).unwrap();
        }
        processor.force_flush(Duration::from_secs(5)).await.unwrap();

        assert_eq!(processor.state(), ProcessorState::Idle);
        assert_eq!(processor.metrics().batches_failed(), 1);
        assert_eq!(processor.metrics().records_dropped(), 4);
        assert_eq!(processor.metrics().records_exported(), 0);
        // Not requeued
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes() {
        let buf = buffer(100, 100);
        let exporter = Arc::new(TestExporter::new());
        let processor = BatchProcessor::start(
            Arc::clone(&buf),
            exporter.clone(),
            config(Duration::from_secs(3600), 10),
        );

        for i in 0..12 {
            buf.try_enqueue(log(i)).unwrap();
        }
        processor.shutdown(Duration::from_secs(5)).await.unwrap();

        assert_eq!(exporter.exported_count(), 12);
        assert_eq!(processor.state(), ProcessorState::Stopped);
        assert_eq!(buf.try_enqueue(log(99)), Err(EnqueueError::Closed));
        // Flush after shutdown is a no-op
        processor.force_flush(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_handle_flushes_in_background() {
        let buf = buffer(100, 100);
        let exporter = Arc::new(TestExporter::new());
        let processor = BatchProcessor::start(
            Arc::clone(&buf),
            exporter.clone(),
            config(Duration::from_secs(3600), 10),
        );
        let mut states = processor.subscribe();

        for i in 0..3 {
            buf.try_enqueue(log(i)).unwrap();
        }
        drop(processor);

        states
            .wait_for(|s| *s == ProcessorState::Stopped)
            .await
            .unwrap();
        assert_eq!(exporter.exported_count(), 3);
        assert_eq!(buf.try_enqueue(log(3)), Err(EnqueueError::Closed));
    }

    #[tokio::test]
    async fn test_double_shutdown_runs_one_flush_cycle() {
        let buf = buffer(100, 100);
        let exporter = Arc::new(TestExporter::new());
        let processor = BatchProcessor::start(
            Arc::clone(&buf),
            exporter.clone(),
            config(Duration::from_secs(3600), 10),
        );
        buf.try_enqueue(log(0)).unwrap();

        assert!(processor.shutdown(Duration::from_secs(5)).await.is_ok());
        assert!(processor.shutdown(Duration::from_secs(5)).await.is_ok());

        assert_eq!(processor.metrics().flush_cycles(), 1);
        assert_eq!(exporter.exported_count(), 1);
        assert_eq!(exporter.batch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_leaves_processor_running() {
        let buf = buffer(100, 100);
        let exporter = Arc::new(GatedExporter {
            gate: Semaphore::new(0),
            inner: TestExporter::new(),
        });
        let processor = BatchProcessor::start(
            Arc::clone(&buf),
            exporter.clone(),
            config(Duration::from_secs(3600), 10),
        );
        buf.try_enqueue(log(0)).unwrap();

        let err = processor.shutdown(Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err.after, Duration::from_millis(100));
        assert_ne!(processor.state(), ProcessorState::Stopped);

        exporter.gate.add_permits(1);
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(processor.state(), ProcessorState::Stopped);
        assert_eq!(exporter.inner.exported_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_inflight_export() {
        let buf = buffer(100, 100);
        let exporter = Arc::new(GatedExporter {
            gate: Semaphore::new(0),
            inner: TestExporter::new(),
        });
        let processor = Arc::new(BatchProcessor::start(
            Arc::clone(&buf),
            exporter.clone(),
            config(Duration::from_secs(3600), 10),
        ));

        buf.try_enqueue(log(0)).unwrap();
        let flusher = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { processor.force_flush(Duration::from_secs(5)).await })
        };

        let mut states = processor.subscribe();
        states
            .wait_for(|s| *s == ProcessorState::Exporting)
            .await
            .unwrap();

        // Arrives mid-export; the second record is only covered by the final flush.
        buf.try_enqueue(log(1)).unwrap();
        let shutdown = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { processor.shutdown(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(processor.state(), ProcessorState::Exporting);

        exporter.gate.add_permits(2);
        flusher.await.unwrap().unwrap();
        shutdown.await.unwrap().unwrap();

        assert_eq!(processor.state(), ProcessorState::Stopped);
        assert_eq!(bodies(&exporter.inner.all_records()), ["record 0", "record 1"]);
    }
}
