//! Providers: the entry points application code emits through.
//!
//! A [`Provider`] wires one buffer, one processor and one exporter together
//! for a single signal kind. [`TelemetryProvider`] groups the three kinds into
//! the context object an application passes to whatever needs to emit.
//! There is no global instance.
//!
//! Records still buffered when the process exits without calling
//! [`TelemetryProvider::shutdown`] are lost.

use crate::batch_processor::{BatchConfig, BatchProcessor, ExportMetrics, ProcessorState};
use crate::buffer::{BoundedBuffer, BufferConfig, BufferMetrics, Enqueued};
use crate::collector_exporter::CollectorExporter;
use crate::config::PipelineConfig;
use crate::error::{ConfigError, EnqueueError, TimedOut};
use crate::exporter::SignalExporterBoxed;
use crate::instrumentation::{Logger, Meter, Tracer};
use crate::resilient_exporter::RetryingExporter;
use crate::signal::{Resource, SignalKind, SignalRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// What happened to an emitted record.
///
/// Emitting never fails in a way the caller has to handle; this is purely
/// informational and is safe to ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Buffered
    Accepted,
    /// Buffered; the oldest buffered record was evicted to make room
    DisplacedOldest,
    /// Discarded by the `drop_newest` policy
    Dropped,
    /// Buffer stayed full past the block timeout, or was full for a non-waiting emit
    BufferFull,
    /// Provider already shut down
    Closed,
    /// Record kind does not match this provider
    WrongKind,
}

impl EmitOutcome {
    /// `true` if the record is now buffered.
    pub fn is_buffered(self) -> bool {
        matches!(self, Self::Accepted | Self::DisplacedOldest)
    }
}

impl From<Result<Enqueued, EnqueueError>> for EmitOutcome {
    fn from(result: Result<Enqueued, EnqueueError>) -> Self {
        match result {
            Ok(Enqueued::Accepted) => Self::Accepted,
            Ok(Enqueued::DisplacedOldest) => Self::DisplacedOldest,
            Err(EnqueueError::Rejected) => Self::Dropped,
            Err(EnqueueError::Full) => Self::BufferFull,
            Err(EnqueueError::Closed) => Self::Closed,
        }
    }
}

/// Buffer, processor and exporter for one signal kind.
pub struct Provider {
    kind: SignalKind,
    buffer: Arc<BoundedBuffer>,
    processor: BatchProcessor,
}

impl Provider {
    /// Creates the buffer and starts the processor task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        kind: SignalKind,
        buffer_config: BufferConfig,
        batch_config: BatchConfig,
        exporter: Arc<dyn SignalExporterBoxed>,
    ) -> Self {
        let buffer = Arc::new(BoundedBuffer::new(kind, buffer_config));
        let processor = BatchProcessor::start(Arc::clone(&buffer), exporter, batch_config);
        Self {
            kind,
            buffer,
            processor,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    /// Buffers `record`; suspends only under the `block` policy, for at most
    /// the block timeout.
    pub async fn emit(&self, record: SignalRecord) -> EmitOutcome {
        if record.kind() != self.kind {
            return EmitOutcome::WrongKind;
        }
        self.buffer.enqueue(record).await.into()
    }

    /// Like [`emit`](Self::emit) but parks the calling OS thread. Not for async tasks.
    pub fn emit_blocking(&self, record: SignalRecord) -> EmitOutcome {
        if record.kind() != self.kind {
            return EmitOutcome::WrongKind;
        }
        self.buffer.enqueue_blocking(record).into()
    }

    /// Never waits. Under `block` a full buffer yields `BufferFull` at once.
    pub fn try_emit(&self, record: SignalRecord) -> EmitOutcome {
        if record.kind() != self.kind {
            return EmitOutcome::WrongKind;
        }
        self.buffer.try_enqueue(record).into()
    }

    pub async fn force_flush(&self, timeout: Duration) -> Result<(), TimedOut> {
        self.processor.force_flush(timeout).await
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<(), TimedOut> {
        self.processor.shutdown(timeout).await
    }

    pub fn state(&self) -> ProcessorState {
        self.processor.state()
    }

    /// Records currently waiting for export
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer_metrics(&self) -> &BufferMetrics {
        self.buffer.metrics()
    }

    pub fn export_metrics(&self) -> &ExportMetrics {
        self.processor.metrics()
    }

    pub fn processor(&self) -> &BatchProcessor {
        &self.processor
    }
}

/// The process-wide telemetry context: one [`Provider`] per signal kind.
pub struct TelemetryProvider {
    resource: Arc<Resource>,
    spans: Arc<Provider>,
    metrics: Arc<Provider>,
    logs: Arc<Provider>,
}

impl TelemetryProvider {
    /// Builds a pipeline exporting every kind to the configured collector,
    /// with retries. Connections are opened on first export.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(config: &PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let resource = Arc::new(config.resource.clone());

        let exporter_for = |kind| -> Result<Arc<dyn SignalExporterBoxed>, ConfigError> {
            let collector = CollectorExporter::new(
                kind,
                &config.collector_endpoint,
                &config.security,
                Arc::clone(&resource),
                config.auth_token.clone(),
            )?;
            Ok(Arc::new(RetryingExporter::new(collector, config.retry_config())))
        };

        let spans = exporter_for(SignalKind::Span)?;
        let metrics = exporter_for(SignalKind::Metric)?;
        let logs = exporter_for(SignalKind::Log)?;

        info!(
            endpoint = %config.collector_endpoint,
            service = %config.resource.service_name,
            overflow_policy = %config.overflow_policy,
            "telemetry pipeline started"
        );
        Ok(Self::with_exporters(config, spans, metrics, logs))
    }

    /// Builds a pipeline around caller-supplied exporters.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_exporters(
        config: &PipelineConfig,
        spans: Arc<dyn SignalExporterBoxed>,
        metrics: Arc<dyn SignalExporterBoxed>,
        logs: Arc<dyn SignalExporterBoxed>,
    ) -> Self {
        let provider = |kind, exporter| {
            Arc::new(Provider::new(
                kind,
                config.buffer_config(),
                config.batch_config(),
                exporter,
            ))
        };

        Self {
            resource: Arc::new(config.resource.clone()),
            spans: provider(SignalKind::Span, spans),
            metrics: provider(SignalKind::Metric, metrics),
            logs: provider(SignalKind::Log, logs),
        }
    }

    /// Same exporter for all three kinds.
    pub fn with_shared_exporter(config: &PipelineConfig, exporter: Arc<dyn SignalExporterBoxed>) -> Self {
        Self::with_exporters(config, Arc::clone(&exporter), Arc::clone(&exporter), exporter)
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn provider(&self, kind: SignalKind) -> &Arc<Provider> {
        match kind {
            SignalKind::Span => &self.spans,
            SignalKind::Metric => &self.metrics,
            SignalKind::Log => &self.logs,
        }
    }

    /// Routes `record` to the provider of its kind.
    pub async fn emit(&self, record: impl Into<SignalRecord>) -> EmitOutcome {
        let record = record.into();
        self.provider(record.kind()).emit(record).await
    }

    pub fn emit_blocking(&self, record: impl Into<SignalRecord>) -> EmitOutcome {
        let record = record.into();
        self.provider(record.kind()).emit_blocking(record)
    }

    pub fn try_emit(&self, record: impl Into<SignalRecord>) -> EmitOutcome {
        let record = record.into();
        self.provider(record.kind()).try_emit(record)
    }

    /// Flushes all kinds concurrently; all must finish within `timeout`.
    pub async fn force_flush(&self, timeout: Duration) -> Result<(), TimedOut> {
        let (spans, metrics, logs) = tokio::join!(
            self.spans.force_flush(timeout),
            self.metrics.force_flush(timeout),
            self.logs.force_flush(timeout),
        );
        spans.and(metrics).and(logs)
    }

    /// Shuts all kinds down concurrently. Safe to call more than once.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), TimedOut> {
        let (spans, metrics, logs) = tokio::join!(
            self.spans.shutdown(timeout),
            self.metrics.shutdown(timeout),
            self.logs.shutdown(timeout),
        );
        let result = spans.and(metrics).and(logs);
        if result.is_ok() {
            info!(
                spans_exported = self.spans.export_metrics().records_exported(),
                metrics_exported = self.metrics.export_metrics().records_exported(),
                logs_exported = self.logs.export_metrics().records_exported(),
                "telemetry pipeline shut down"
            );
        }
        result
    }

    pub fn tracer(&self) -> Tracer {
        Tracer::new(Arc::clone(&self.spans))
    }

    pub fn meter(&self) -> Meter {
        Meter::new(Arc::clone(&self.metrics))
    }

    pub fn logger(&self) -> Logger {
        Logger::new(Arc::clone(&self.logs))
    }
}
