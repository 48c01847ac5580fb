//! Retry wrapper for exporters.
//!
//! [`RetryingExporter`] decorates any base [`SignalExporter`]: each attempt is
//! bounded by `attempt_timeout`, transient failures are retried after an
//! exponentially growing, capped, jittered delay, and permanent failures
//! return immediately.

use crate::error::ExportError;
use crate::exporter::SignalExporter;
use crate::signal::Batch;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

// =============================================================================
// RETRY CONFIGURATION
// =============================================================================

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = just the initial attempt).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the un-jittered delay.
    pub max_delay: Duration,
    /// Growth factor per retry.
    pub backoff_multiplier: f64,
    /// Extra random delay, as a fraction of the computed delay (0.0..=1.0).
    pub jitter: f64,
    /// Deadline for a single attempt; expiry counts as a retryable failure.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: 0.1,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay before `attempt` (0-indexed; attempt 0 has none).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Adds up to `jitter × delay` of random slack.
    fn jittered(&self, delay: Duration) -> Duration {
        let fraction = self.jitter.clamp(0.0, 1.0);
        let range_ms = (delay.as_millis() as f64 * fraction) as u64;
        if range_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=range_ms))
    }
}

// =============================================================================
// RETRYING EXPORTER
// =============================================================================

/// An exporter wrapper that retries transient failures with exponential backoff.
///
/// # Example
///
/// ```ignore
/// let collector = CollectorExporter::new(kind, "localhost:4317", &security, resource, None)?;
/// let retrying = RetryingExporter::new(collector, RetryConfig::default());
///
/// // Up to 4 attempts, each bounded by attempt_timeout
/// retrying.export(batch).await?;
/// ```
pub struct RetryingExporter<E: SignalExporter> {
    inner: E,
    config: RetryConfig,
    /// Metrics: retry attempts made
    total_retries: AtomicU64,
    /// Metrics: exports that succeeded after at least one retry
    recovered_exports: AtomicU64,
    /// Metrics: exports that failed for good
    failed_exports: AtomicU64,
}

impl<E: SignalExporter> RetryingExporter<E> {
    pub fn new(inner: E, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
            recovered_exports: AtomicU64::new(0),
            failed_exports: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: E) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn recovered_exports(&self) -> u64 {
        self.recovered_exports.load(Ordering::Relaxed)
    }

    pub fn failed_exports(&self) -> u64 {
        self.failed_exports.load(Ordering::Relaxed)
    }

    async fn attempt(&self, batch: Batch) -> Result<(), ExportError> {
        match timeout(self.config.attempt_timeout, self.inner.export(batch)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ExportError::Timeout),
        }
    }
}

impl<E: SignalExporter> SignalExporter for RetryingExporter<E> {
    async fn export(&self, batch: Batch) -> Result<(), ExportError> {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut last_error = ExportError::Timeout;

        for attempt in 0..max_attempts {
            let delay = self.config.delay_for_attempt(attempt);
            if !delay.is_zero() {
                debug_assert!(
                    delay <= self.config.max_delay,
                    "backoff delay {:?} exceeds max_delay {:?}",
                    delay,
                    self.config.max_delay
                );
                let delay = self.config.jittered(delay);
                self.total_retries.fetch_add(1, Ordering::Relaxed);
                debug!(
                    exporter = SignalExporter::name(&self.inner),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "retrying export"
                );
                sleep(delay).await;
            }

            // Batch clones share the record slice.
            match self.attempt(batch.clone()).await {
                Ok(()) => {
                    if attempt > 0 {
                        self.recovered_exports.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    self.failed_exports.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        exporter = SignalExporter::name(&self.inner),
                        error = %e,
                        "export failed permanently"
                    );
                    return Err(e);
                }
                Err(e) => last_error = e,
            }
        }

        self.failed_exports.fetch_add(1, Ordering::Relaxed);
        Err(ExportError::RetriesExhausted {
            attempts: max_attempts,
            last_error: last_error.to_string(),
        })
    }

    fn name(&self) -> &str {
        SignalExporter::name(&self.inner)
    }
}
