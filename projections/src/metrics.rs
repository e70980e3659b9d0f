//! Prometheus metrics for the projection engine.
//!
//! Every record made through the [`InMemoryProjectionMonitor`](crate::InMemoryProjectionMonitor)
//! is also emitted through the `metrics` facade. Installing the exporter makes
//! those series available in the Prometheus text format:
//!
//! ```rust,no_run
//! use foldline_projections::metrics::MetricsExporter;
//!
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//!
//! // Later, e.g. from an HTTP handler
//! if let Some(body) = exporter.render() {
//!     println!("{body}");
//! }
//! # Ok::<(), foldline_projections::metrics::MetricsError>(())
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

/// Metric names.
pub mod names {
    /// Events processed (counter)
    pub const EVENTS_PROCESSED: &str = "foldline_projection_events_processed_total";
    /// Events skipped after a failure (counter)
    pub const EVENTS_SKIPPED: &str = "foldline_projection_events_skipped_total";
    /// Events dropped by backpressure or a stopped worker (counter)
    pub const EVENTS_DROPPED: &str = "foldline_projection_events_dropped_total";
    /// Checkpoints written (counter)
    pub const CHECKPOINTS_WRITTEN: &str = "foldline_projection_checkpoints_written_total";
    /// Retry attempts (counter)
    pub const RETRIES: &str = "foldline_projection_retries_total";
    /// Halted workers (counter)
    pub const WORKERS_STOPPED: &str = "foldline_projection_workers_stopped_total";
    /// Last processed position (gauge)
    pub const POSITION: &str = "foldline_projection_position";
    /// Unprocessed events known to exist (gauge)
    pub const LAG: &str = "foldline_projection_lag";
    /// Partition queue depth (gauge)
    pub const QUEUE_DEPTH: &str = "foldline_projection_queue_depth";
    /// Running partition workers (gauge)
    pub const WORKERS: &str = "foldline_projection_workers";
    /// Handler invocation latency (histogram)
    pub const HANDLER_DURATION: &str = "foldline_projection_handler_duration_seconds";
}

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installs a global Prometheus recorder and renders its output.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Create an exporter that has not been installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe all metrics and install the global recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed is not an error; the exporter then
    /// has no handle of its own.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                describe_metrics();
                self.handle = Some(handle);
                tracing::info!("Prometheus metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if message.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            }
        }
    }

    /// The recorder handle, once installed.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in the Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register descriptions for every projection metric.
pub fn describe_metrics() {
    describe_counter!(names::EVENTS_PROCESSED, "Events processed by projection handlers");
    describe_counter!(names::EVENTS_SKIPPED, "Events skipped after a handler failure");
    describe_counter!(
        names::EVENTS_DROPPED,
        "Events dropped by backpressure or because the partition worker stopped"
    );
    describe_counter!(names::CHECKPOINTS_WRITTEN, "Checkpoints written");
    describe_counter!(names::RETRIES, "Handler retry attempts");
    describe_counter!(names::WORKERS_STOPPED, "Partition workers halted by the error policy");
    describe_gauge!(names::POSITION, "Last processed position");
    describe_gauge!(names::LAG, "Known events not yet processed");
    describe_gauge!(names::QUEUE_DEPTH, "Events waiting in a partition queue");
    describe_gauge!(names::WORKERS, "Running partition workers");
    describe_histogram!(names::HANDLER_DURATION, "Time taken by one handler invocation");
}

/// Record one handler invocation.
pub(crate) fn record_handler_duration(projection: &str, duration: Duration) {
    histogram!(names::HANDLER_DURATION, "projection" => projection.to_string())
        .record(duration.as_secs_f64());
}

/// Record one retry.
pub(crate) fn record_retry(projection: &str) {
    metrics::counter!(names::RETRIES, "projection" => projection.to_string()).increment(1);
}
