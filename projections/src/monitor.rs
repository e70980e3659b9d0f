//! Projection monitoring: throughput, lag, queue depth, drops.
//!
//! The engine and the replay service report to a [`ProjectionMonitor`]. The
//! default [`InMemoryProjectionMonitor`] keeps one [`ProjectionMetrics`] record
//! per `(projection, partition)` key, each behind its own lock, and forwards
//! every update to the `metrics` facade so an installed Prometheus recorder
//! (see [`crate::metrics`]) exports the same numbers.
//!
//! Projection-level records (partition `None`) carry the worker count and
//! aggregate skip and stop counts; partition records carry everything else.

use crate::metrics::names;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Metrics for one projection, or one partition of a projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectionMetrics {
    /// Projection name
    pub projection: String,
    /// Partition key, or `None` for the projection-level record
    pub partition: Option<String>,
    /// Last processed position
    pub current_position: Option<u64>,
    /// Latest position known to exist
    pub latest_position: Option<u64>,
    /// `latest - current`, never negative
    pub lag: u64,
    /// Events processed (including skipped ones)
    pub events_processed: u64,
    /// Events skipped after a failure
    pub events_skipped: u64,
    /// Events dropped by backpressure or a stopped worker
    pub events_dropped: u64,
    /// Checkpoints written
    pub checkpoints_written: u64,
    /// Position of the last checkpoint written
    pub last_checkpoint_position: Option<u64>,
    /// Current queue depth
    pub queue_depth: usize,
    /// Running partition workers
    pub worker_count: usize,
    /// Workers (or key functions) halted by their error policy
    pub workers_stopped: u64,
    /// When the first event was processed
    pub first_event_at: Option<DateTime<Utc>>,
    /// When the last event was processed
    pub last_event_at: Option<DateTime<Utc>>,
    /// When the last checkpoint was written
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    /// Lowest position seen, so lag counts from where the partition started
    #[serde(skip)]
    first_seen_position: Option<u64>,
}

impl ProjectionMetrics {
    fn new(projection: &str, partition: Option<&str>) -> Self {
        Self {
            projection: projection.to_string(),
            partition: partition.map(str::to_string),
            current_position: None,
            latest_position: None,
            lag: 0,
            events_processed: 0,
            events_skipped: 0,
            events_dropped: 0,
            checkpoints_written: 0,
            last_checkpoint_position: None,
            queue_depth: 0,
            worker_count: 0,
            workers_stopped: 0,
            first_event_at: None,
            last_event_at: None,
            last_checkpoint_at: None,
            first_seen_position: None,
        }
    }

    fn observe_latest(&mut self, position: u64) {
        self.first_seen_position = Some(self.first_seen_position.map_or(position, |first| first.min(position)));
        self.latest_position = Some(self.latest_position.map_or(position, |latest| latest.max(position)));
        self.recompute_lag();
    }

    fn recompute_lag(&mut self) {
        self.lag = match (self.latest_position, self.current_position) {
            (Some(latest), Some(current)) => latest.saturating_sub(current),
            (Some(latest), None) => self
                .first_seen_position
                .map_or(0, |first| latest.saturating_sub(first).saturating_add(1)),
            _ => 0,
        };
    }
}

/// Sink for projection metrics.
pub trait ProjectionMonitor: Send + Sync {
    /// An event at `position` finished processing (or was skipped).
    fn record_event_processed(&self, projection: &str, partition: &str, position: u64);

    /// A checkpoint was written.
    fn record_checkpoint_written(&self, projection: &str, partition: &str, position: u64);

    /// Latest known position and current processed position.
    fn record_lag(&self, projection: &str, partition: &str, latest_position: u64, current_position: Option<u64>);

    /// Number of running partition workers.
    fn record_worker_count(&self, projection: &str, count: usize);

    /// Current depth of a partition queue.
    fn record_queue_depth(&self, projection: &str, partition: &str, depth: usize);

    /// An event was dropped.
    fn record_event_dropped(&self, projection: &str, partition: &str);

    /// An event was skipped after a failure. `None` marks an event whose key
    /// function failed, so it never reached a partition.
    fn record_event_skipped(&self, projection: &str, partition: Option<&str>);

    /// A worker was halted by its error policy. `None` marks a handler whose
    /// key function stopped ingestion.
    fn record_worker_stopped(&self, projection: &str, partition: Option<&str>);

    /// Metrics for a projection (`partition = None`) or one of its partitions.
    fn get_metrics(&self, projection: &str, partition: Option<&str>) -> Option<ProjectionMetrics>;

    /// Every record.
    fn get_all_metrics(&self) -> Vec<ProjectionMetrics>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MetricsKey {
    projection: String,
    partition: Option<String>,
}

/// Default monitor: one independently locked record per key.
#[derive(Debug, Default)]
pub struct InMemoryProjectionMonitor {
    records: RwLock<HashMap<MetricsKey, Arc<Mutex<ProjectionMetrics>>>>,
}

impl InMemoryProjectionMonitor {
    /// Create an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, projection: &str, partition: Option<&str>, f: impl FnOnce(&mut ProjectionMetrics)) {
        let record = self.record(projection, partition);
        let mut metrics = record.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics);
    }

    fn record(&self, projection: &str, partition: Option<&str>) -> Arc<Mutex<ProjectionMetrics>> {
        let key = MetricsKey {
            projection: projection.to_string(),
            partition: partition.map(str::to_string),
        };

        if let Some(record) = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Arc::clone(record);
        }

        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            records
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(ProjectionMetrics::new(projection, partition)))),
        )
    }
}

fn labels(projection: &str, partition: &str) -> [(&'static str, String); 2] {
    [
        ("projection", projection.to_string()),
        ("partition", partition.to_string()),
    ]
}

impl ProjectionMonitor for InMemoryProjectionMonitor {
    fn record_event_processed(&self, projection: &str, partition: &str, position: u64) {
        let now = Utc::now();
        self.update(projection, Some(partition), |m| {
            m.events_processed += 1;
            m.current_position = Some(m.current_position.map_or(position, |current| current.max(position)));
            m.first_event_at.get_or_insert(now);
            m.last_event_at = Some(now);
            m.observe_latest(position);
        });
        metrics::counter!(names::EVENTS_PROCESSED, &labels(projection, partition)).increment(1);
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(names::POSITION, &labels(projection, partition)).set(position as f64);
    }

    fn record_checkpoint_written(&self, projection: &str, partition: &str, position: u64) {
        let now = Utc::now();
        self.update(projection, Some(partition), |m| {
            m.checkpoints_written += 1;
            m.last_checkpoint_position = Some(position);
            m.last_checkpoint_at = Some(now);
        });
        metrics::counter!(names::CHECKPOINTS_WRITTEN, &labels(projection, partition)).increment(1);
    }

    fn record_lag(&self, projection: &str, partition: &str, latest_position: u64, current_position: Option<u64>) {
        let mut observed_lag = 0;
        self.update(projection, Some(partition), |m| {
            if let Some(current) = current_position {
                m.current_position = Some(m.current_position.map_or(current, |c| c.max(current)));
            }
            m.observe_latest(latest_position);
            observed_lag = m.lag;
        });
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(names::LAG, &labels(projection, partition)).set(observed_lag as f64);
    }

    fn record_worker_count(&self, projection: &str, count: usize) {
        self.update(projection, None, |m| m.worker_count = count);
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(names::WORKERS, "projection" => projection.to_string()).set(count as f64);
    }

    fn record_queue_depth(&self, projection: &str, partition: &str, depth: usize) {
        self.update(projection, Some(partition), |m| m.queue_depth = depth);
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(names::QUEUE_DEPTH, &labels(projection, partition)).set(depth as f64);
    }

    fn record_event_dropped(&self, projection: &str, partition: &str) {
        self.update(projection, Some(partition), |m| m.events_dropped += 1);
        metrics::counter!(names::EVENTS_DROPPED, &labels(projection, partition)).increment(1);
    }

    fn record_event_skipped(&self, projection: &str, partition: Option<&str>) {
        if let Some(partition) = partition {
            self.update(projection, Some(partition), |m| m.events_skipped += 1);
        }
        self.update(projection, None, |m| m.events_skipped += 1);
        metrics::counter!(names::EVENTS_SKIPPED, "projection" => projection.to_string()).increment(1);
    }

    fn record_worker_stopped(&self, projection: &str, partition: Option<&str>) {
        if let Some(partition) = partition {
            self.update(projection, Some(partition), |m| m.workers_stopped += 1);
        }
        self.update(projection, None, |m| m.workers_stopped += 1);
        metrics::counter!(names::WORKERS_STOPPED, "projection" => projection.to_string()).increment(1);
    }

    fn get_metrics(&self, projection: &str, partition: Option<&str>) -> Option<ProjectionMetrics> {
        let key = MetricsKey {
            projection: projection.to_string(),
            partition: partition.map(str::to_string),
        };
        let record = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .map(Arc::clone)?;
        let metrics = record.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Some(metrics)
    }

    fn get_all_metrics(&self) -> Vec<ProjectionMetrics> {
        let records: Vec<_> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Arc::clone)
            .collect();
        let mut all: Vec<_> = records
            .iter()
            .map(|record| record.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect();
        all.sort_by(|a, b| (&a.projection, &a.partition).cmp(&(&b.projection, &b.partition)));
        all
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn processed_events_advance_position_and_lag() {
        let monitor = InMemoryProjectionMonitor::new();
        monitor.record_lag("balances", "acct-1", 9, None);
        monitor.record_event_processed("balances", "acct-1", 4);

        let metrics = monitor.get_metrics("balances", Some("acct-1")).unwrap();
        assert_eq!(metrics.current_position, Some(4));
        assert_eq!(metrics.latest_position, Some(9));
        assert_eq!(metrics.lag, 5);
        assert_eq!(metrics.events_processed, 1);
        assert!(metrics.first_event_at.is_some());
    }

    #[test]
    fn lag_counts_from_the_first_position_seen() {
        let monitor = InMemoryProjectionMonitor::new();
        monitor.record_lag("balances", "acct-1", 10, None);

        let metrics = monitor.get_metrics("balances", Some("acct-1")).unwrap();
        assert_eq!(metrics.lag, 1);

        monitor.record_lag("balances", "acct-1", 12, None);
        let metrics = monitor.get_metrics("balances", Some("acct-1")).unwrap();
        assert_eq!(metrics.lag, 3);

        monitor.record_event_processed("balances", "acct-1", 10);
        let metrics = monitor.get_metrics("balances", Some("acct-1")).unwrap();
        assert_eq!(metrics.lag, 2);
    }

    #[test]
    fn lag_is_never_negative() {
        let monitor = InMemoryProjectionMonitor::new();
        monitor.record_lag("balances", "acct-1", 2, Some(7));

        let metrics = monitor.get_metrics("balances", Some("acct-1")).unwrap();
        assert_eq!(metrics.lag, 0);
    }

    #[test]
    fn partitions_are_tracked_independently() {
        let monitor = InMemoryProjectionMonitor::new();
        monitor.record_event_dropped("balances", "acct-1");
        monitor.record_event_dropped("balances", "acct-1");
        monitor.record_event_skipped("balances", Some("acct-2"));
        monitor.record_queue_depth("balances", "acct-2", 3);
        monitor.record_worker_count("balances", 2);
        monitor.record_worker_stopped("balances", Some("acct-2"));

        let first = monitor.get_metrics("balances", Some("acct-1")).unwrap();
        let second = monitor.get_metrics("balances", Some("acct-2")).unwrap();
        let overall = monitor.get_metrics("balances", None).unwrap();

        assert_eq!(first.events_dropped, 2);
        assert_eq!(second.events_dropped, 0);
        assert_eq!(second.events_skipped, 1);
        assert_eq!(second.queue_depth, 3);
        assert_eq!(second.workers_stopped, 1);
        assert_eq!(overall.worker_count, 2);
        assert_eq!(overall.workers_stopped, 1);
        assert_eq!(overall.events_skipped, 1);
        assert_eq!(monitor.get_all_metrics().len(), 3);
        assert!(monitor.get_metrics("unknown", None).is_none());
    }

    #[test]
    fn checkpoint_writes_are_recorded() {
        let monitor = InMemoryProjectionMonitor::new();
        monitor.record_checkpoint_written("balances", "_default", 99);

        let metrics = monitor.get_metrics("balances", Some("_default")).unwrap();
        assert_eq!(metrics.checkpoints_written, 1);
        assert_eq!(metrics.last_checkpoint_position, Some(99));
        assert!(metrics.last_checkpoint_at.is_some());
    }

    #[test]
    fn updates_are_forwarded_to_the_metrics_facade() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let monitor = InMemoryProjectionMonitor::new();

        metrics::with_local_recorder(&recorder, || {
            monitor.record_event_processed("balances", "acct-1", 3);
            monitor.record_event_dropped("balances", "acct-1");
        });

        let rendered = handle.render();
        assert!(rendered.contains(names::EVENTS_PROCESSED));
        assert!(rendered.contains(names::EVENTS_DROPPED));
        assert!(rendered.contains("projection=\"balances\""));
    }
}
