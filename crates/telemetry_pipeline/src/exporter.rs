//! Exporter abstraction and the simple in-process exporters.
//!
//! The network exporter lives in [`collector_exporter`](crate::collector_exporter);
//! retries are layered on top by [`RetryingExporter`](crate::RetryingExporter).

use crate::error::ExportError;
use crate::signal::{Batch, SignalRecord};
use std::future::Future;
use std::io::Write;
use std::pin::Pin;

/// Trait for exporting batches of signal records to a backend.
///
/// Uses `impl Future` in the trait instead of `#[async_trait]`.
///
/// # Note on Object Safety
///
/// `impl Future` return types are not object-safe. The processor stores
/// exporters as `Arc<dyn SignalExporterBoxed>`, which every `SignalExporter`
/// implements through the blanket impl below.
pub trait SignalExporter: Send + Sync {
    /// Exports one batch. Called by at most one processor at a time.
    fn export(&self, batch: Batch) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Returns the exporter name for logging.
    fn name(&self) -> &str;
}

/// Object-safe version of SignalExporter for dynamic dispatch.
pub trait SignalExporterBoxed: Send + Sync {
    /// Exports a batch (boxed future for object safety).
    fn export_boxed(
        &self,
        batch: Batch,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>>;

    /// Returns the exporter name for logging.
    fn name(&self) -> &str;
}

/// Blanket implementation: any SignalExporter can be used as SignalExporterBoxed
impl<T: SignalExporter> SignalExporterBoxed for T {
    fn export_boxed(
        &self,
        batch: Batch,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>> {
        Box::pin(self.export(batch))
    }

    fn name(&self) -> &str {
        SignalExporter::name(self)
    }
}

/// Shared exporters export through the inner value, so a caller can keep a
/// handle to an exporter it also hands to a wrapper.
impl<E: SignalExporter> SignalExporter for std::sync::Arc<E> {
    fn export(&self, batch: Batch) -> impl Future<Output = Result<(), ExportError>> + Send {
        SignalExporter::export(&**self, batch)
    }

    fn name(&self) -> &str {
        SignalExporter::name(&**self)
    }
}

/// Writes each record as one JSON line on stdout. Handy for local development.
pub struct StdoutExporter {
    pretty: bool,
}

impl StdoutExporter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn render(&self, record: &SignalRecord) -> Result<String, ExportError> {
        let rendered = if self.pretty {
            serde_json::to_string_pretty(record)
        } else {
            serde_json::to_string(record)
        };
        rendered.map_err(|e| ExportError::Serialization(e.to_string()))
    }
}

impl SignalExporter for StdoutExporter {
    async fn export(&self, batch: Batch) -> Result<(), ExportError> {
        let mut out = String::new();
        for record in batch.records() {
            out.push_str(&self.render(record)?);
            out.push('\n');
        }

        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(out.as_bytes())
            .and_then(|()| stdout.flush())
            .map_err(|e| ExportError::Transport(e.to_string()))
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// Discards every batch (for benchmarking)
#[derive(Default)]
pub struct NullExporter;

impl NullExporter {
    pub fn new() -> Self {
        Self
    }
}

impl SignalExporter for NullExporter {
    async fn export(&self, _batch: Batch) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Records every exported batch for verification
#[cfg(test)]
pub(crate) struct TestExporter {
    batches: std::sync::Mutex<Vec<Batch>>,
}

#[cfg(test)]
impl TestExporter {
    pub(crate) fn new() -> Self {
        Self {
            batches: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn exported_count(&self) -> usize {
        self.batches.lock().unwrap().iter().map(Batch::len).sum()
    }

    pub(crate) fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub(crate) fn all_records(&self) -> Vec<SignalRecord> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.records().to_vec())
            .collect()
    }
}

#[cfg(test)]
impl SignalExporter for TestExporter {
    async fn export(&self, batch: Batch) -> Result<(), ExportError> {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }

    fn name(&self) -> &str {
        "test"
    }
}
