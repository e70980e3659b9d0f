//! Replay of historical events through a projection's handlers.
//!
//! Replay reads the projection's stream from an [`EventStore`] (the stream name
//! is the projection name) and feeds every retained event through the same
//! handlers the live engine uses, sequentially and in ascending position order.
//!
//! Handler failures are logged and counted; replay always continues past them
//! and never applies the projection's live retry or stop policy.
//!
//! # Checkpoints
//!
//! | Mode        | Writes                                                   |
//! |-------------|----------------------------------------------------------|
//! | `Normal`    | every `batch_size` events, plus the trailing partial batch |
//! | `FinalOnly` | once, after the read completes                           |
//! | `None`      | never                                                    |
//!
//! A dry run never writes, whatever the mode. Unless replay resumes from the
//! checkpoint or writes nothing, the checkpoint is reset first, so running the
//! same replay twice leaves the same state behind.
//!
//! # Example
//!
//! ```ignore
//! let replay = ReplayService::new(registry, checkpoints).with_event_store(store);
//!
//! let report = replay
//!     .replay("balances", &ReplayOptions::new().from_position(100), ShutdownSignal::never())
//!     .await?;
//! tracing::info!(processed = report.events_processed, "Rebuilt balances");
//! ```

use crate::checkpoint::CheckpointBatcher;
use crate::monitor::{InMemoryProjectionMonitor, ProjectionMonitor};
use crate::registry::{HandlerRegistry, RegisteredHandler};
use crate::router;
use foldline_core::checkpoint::{CheckpointKey, CheckpointStore};
use foldline_core::error::{ProjectionError, Result};
use foldline_core::event::{EventType, StoredEvent};
use foldline_core::event_store::EventStore;
use foldline_core::options::{CheckpointMode, ReplayOptions};
use foldline_core::projection::{DEFAULT_PARTITION, ProcessingMode, ProjectionContext};
use foldline_core::shutdown::ShutdownSignal;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of one replay call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Projection that was replayed
    pub projection: String,
    /// First position requested from the store
    pub start_position: u64,
    /// Events read within the position bounds
    pub events_read: u64,
    /// Events passed to a handler, including those whose handler failed
    pub events_processed: u64,
    /// Events skipped by the partition filter or with no handler in this projection
    pub events_filtered: u64,
    /// Events whose handler or partition key failed
    pub handler_failures: u64,
    /// Position of the last processed event
    pub last_position: Option<u64>,
    /// Checkpoint writes made
    pub checkpoints_written: u64,
    /// Whether the replay was interrupted by shutdown
    pub cancelled: bool,
    /// Whether this was a dry run
    pub dry_run: bool,
}

/// Replays historical events for registered projections.
pub struct ReplayService {
    registry: Arc<HandlerRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    store: Option<Arc<dyn EventStore>>,
    monitor: Arc<dyn ProjectionMonitor>,
}

impl ReplayService {
    /// Create a replay service without an event store.
    ///
    /// Until a store is attached with [`with_event_store`](Self::with_event_store),
    /// every replay returns an empty report.
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            registry,
            checkpoints,
            store: None,
            monitor: Arc::new(InMemoryProjectionMonitor::new()),
        }
    }

    /// Attach the historical event store.
    #[must_use]
    pub fn with_event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a different monitor.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<dyn ProjectionMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Replay a projection's stream.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Configuration`] for an empty name or invalid options
    /// - [`ProjectionError::Registration`] for an unknown projection
    /// - [`ProjectionError::EventStore`] if the store cannot be read
    /// - the checkpoint store's error if a checkpoint cannot be loaded, reset or saved
    ///
    /// Configuration and registration errors are returned before any event is read.
    pub async fn replay(
        &self,
        projection_name: &str,
        options: &ReplayOptions,
        mut shutdown: ShutdownSignal,
    ) -> Result<ReplayReport> {
        if projection_name.is_empty() {
            return Err(ProjectionError::Configuration(
                "projection name must not be empty".to_string(),
            ));
        }
        options.validate()?;

        let projection_options = self.registry.projection_options(projection_name).ok_or_else(|| {
            ProjectionError::Registration(format!("unknown projection '{projection_name}'"))
        })?;

        let mut report = ReplayReport {
            projection: projection_name.to_string(),
            dry_run: options.dry_run,
            ..ReplayReport::default()
        };

        let Some(store) = &self.store else {
            tracing::warn!(
                projection = %projection_name,
                "No event store configured, nothing to replay"
            );
            return Ok(report);
        };

        let partition = options.partition.as_deref().unwrap_or(DEFAULT_PARTITION);
        let key = CheckpointKey::for_partition(projection_name, partition);

        report.start_position = match (options.from_position, options.from_checkpoint) {
            (Some(position), _) => position,
            (None, true) => self
                .checkpoints
                .get_checkpoint(&key)
                .await?
                .map_or(0, |position| position.saturating_add(1)),
            (None, false) => 0,
        };

        if !options.from_checkpoint && options.writes_checkpoints() {
            self.checkpoints.reset_checkpoint(&key).await?;
            tracing::debug!(projection = %projection_name, checkpoint = %key, "Checkpoint reset");
        }

        let handlers: HashMap<EventType, Arc<RegisteredHandler>> = self
            .registry
            .handlers_for_projection(projection_name)
            .into_iter()
            .map(|handler| (handler.event_type(), handler))
            .collect();

        let mut batcher = options.writes_checkpoints().then(|| {
            let batch_size = match options.checkpoint_mode {
                CheckpointMode::FinalOnly => u64::MAX,
                CheckpointMode::Normal | CheckpointMode::None => options
                    .batch_size
                    .unwrap_or(projection_options.checkpoint_batch_size),
            };
            CheckpointBatcher::new(key.clone(), batch_size)
        });

        tracing::info!(
            projection = %projection_name,
            partition = %partition,
            from = report.start_position,
            to = ?options.to_position,
            dry_run = options.dry_run,
            checkpoint_mode = ?options.checkpoint_mode,
            "Replay started"
        );

        let mut events = store.read(projection_name, report.start_position).await?;
        let projection: Arc<str> = Arc::from(projection_name);
        let mode = ProcessingMode::Replay {
            dry_run: options.dry_run,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                next = events.next() => next,
            };

            let stored = match next {
                None => break,
                Some(Ok(stored)) => stored,
                Some(Err(e)) => {
                    tracing::error!(projection = %projection_name, error = %e, "Replay read failed");
                    if options.checkpoint_mode == CheckpointMode::Normal {
                        if let Some(batcher) = batcher.as_mut() {
                            if let Err(flush_error) = self.flush(batcher, &mut report, partition).await {
                                tracing::error!(
                                    projection = %projection_name,
                                    error = %flush_error,
                                    "Failed to save checkpoint after read failure"
                                );
                            }
                        }
                    }
                    return Err(e.into());
                }
            };

            if options.to_position.is_some_and(|to| stored.position > to) {
                break;
            }
            report.events_read += 1;

            let StoredEvent { position, event } = stored;
            let Some(handler) = handlers.get(&event.event_type()) else {
                report.events_filtered += 1;
                continue;
            };

            let partition_key = match router::partition_key(handler, &event) {
                Ok(partition_key) => partition_key,
                Err(_) if options.partition.is_some() => {
                    report.events_filtered += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        projection = %projection_name,
                        position,
                        error = %e,
                        "Partition key failed during replay, continuing"
                    );
                    report.handler_failures += 1;
                    report.events_processed += 1;
                    report.last_position = Some(position);
                    if let Some(batcher) = batcher.as_mut() {
                        if batcher.record(position) {
                            self.flush(batcher, &mut report, partition).await?;
                        }
                    }
                    continue;
                }
            };
            if options.partition.as_deref().is_some_and(|wanted| wanted != partition_key) {
                report.events_filtered += 1;
                continue;
            }

            let ctx = ProjectionContext::new(
                Arc::clone(&projection),
                Arc::from(partition_key.as_str()),
                position,
                mode,
                shutdown.clone(),
            );
            if let Err(e) = handler.invoke(event, ctx).await {
                tracing::warn!(
                    projection = %projection_name,
                    partition = %partition_key,
                    position,
                    error = %e,
                    "Handler failed during replay, continuing"
                );
                report.handler_failures += 1;
            }

            report.events_processed += 1;
            report.last_position = Some(position);
            self.monitor
                .record_event_processed(projection_name, &partition_key, position);

            if let Some(batcher) = batcher.as_mut() {
                if batcher.record(position) {
                    self.flush(batcher, &mut report, partition).await?;
                }
            }
        }

        if let Some(batcher) = batcher.as_mut() {
            let write = match options.checkpoint_mode {
                CheckpointMode::Normal => true,
                CheckpointMode::FinalOnly => !report.cancelled,
                CheckpointMode::None => false,
            };
            if write {
                self.flush(batcher, &mut report, partition).await?;
            }
        }

        tracing::info!(
            projection = %projection_name,
            read = report.events_read,
            processed = report.events_processed,
            filtered = report.events_filtered,
            failures = report.handler_failures,
            last_position = ?report.last_position,
            cancelled = report.cancelled,
            "Replay finished"
        );
        Ok(report)
    }

    async fn flush(&self, batcher: &mut CheckpointBatcher, report: &mut ReplayReport, partition: &str) -> Result<()> {
        if let Some(position) = batcher.flush(self.checkpoints.as_ref()).await? {
            report.checkpoints_written += 1;
            self.monitor
                .record_checkpoint_written(&report.projection, partition, position);
            tracing::debug!(
                projection = %report.projection,
                checkpoint = %batcher.key(),
                position,
                "Replay checkpoint saved"
            );
        }
        Ok(())
    }
}
