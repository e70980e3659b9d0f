//! Sequential partition workers.
//!
//! One worker consumes one partition queue, strictly in order. Before each
//! invocation it takes a permit from the projection's semaphore, which bounds
//! concurrent handler invocations across all partitions of the projection to
//! `max_degree_of_parallelism`. The permit is held across retries of the same
//! event and released once the event completes, is skipped, or stops the
//! worker.
//!
//! ```text
//! queue ─▶ pop ─▶ acquire permit ─▶ invoke ─▶ policy ─┬─ Complete/Skip ─▶ checkpoint batch
//!                                     ▲                ├─ Retry ─▶ backoff ─┘
//!                                     └────────────────┘
//!                                                      └─ Stop ─▶ halt partition
//! ```

use crate::checkpoint::CheckpointBatcher;
use crate::metrics;
use crate::monitor::ProjectionMonitor;
use crate::policy::{ErrorPolicy, PolicyDecision};
use crate::queue::{PartitionQueue, QueuedEvent};
use foldline_core::checkpoint::{CheckpointKey, CheckpointStore};
use foldline_core::projection::{ProcessingMode, ProjectionContext};
use foldline_core::shutdown::ShutdownSignal;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;

/// State shared by every worker of one projection.
pub(crate) struct WorkerShared {
    pub(crate) projection: Arc<str>,
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) policy: ErrorPolicy,
    pub(crate) checkpoint_batch_size: u64,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) monitor: Arc<dyn ProjectionMonitor>,
    pub(crate) active_workers: AtomicUsize,
}

/// How a worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    /// The queue was closed and fully processed
    Drained,
    /// Immediate shutdown; queued events were abandoned
    Abandoned,
    /// The error policy halted the partition at `position`
    Stopped { position: u64 },
}

enum EventResult {
    Processed,
    Skipped,
    Stopped,
    Abandoned,
}

pub(crate) struct PartitionWorker {
    shared: Arc<WorkerShared>,
    partition: Arc<str>,
    queue: Arc<PartitionQueue>,
    batcher: CheckpointBatcher,
    shutdown: ShutdownSignal,
}

impl PartitionWorker {
    pub(crate) fn new(
        shared: Arc<WorkerShared>,
        partition: Arc<str>,
        queue: Arc<PartitionQueue>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let key = CheckpointKey::for_partition(&shared.projection, &partition);
        let batcher = CheckpointBatcher::new(key, shared.checkpoint_batch_size);
        Self {
            shared,
            partition,
            queue,
            batcher,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) -> WorkerExit {
        let projection = Arc::clone(&self.shared.projection);
        let partition = Arc::clone(&self.partition);
        tracing::debug!(projection = %projection, partition = %partition, "Partition worker started");

        let exit = loop {
            let next = tokio::select! {
                biased;
                () = self.shutdown.immediate() => None,
                item = self.queue.pop() => item,
            };
            let Some(item) = next else {
                break if self.shutdown.is_immediate() {
                    WorkerExit::Abandoned
                } else {
                    WorkerExit::Drained
                };
            };

            self.shared
                .monitor
                .record_queue_depth(&projection, &partition, self.queue.len());

            let position = item.position;
            match self.process(item).await {
                EventResult::Processed => self.complete(position, false).await,
                EventResult::Skipped => self.complete(position, true).await,
                EventResult::Stopped => {
                    self.halt(position);
                    break WorkerExit::Stopped { position };
                }
                EventResult::Abandoned => break WorkerExit::Abandoned,
            }
        };

        self.flush().await;

        let remaining = self
            .shared
            .active_workers
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        self.shared.monitor.record_worker_count(&projection, remaining);
        tracing::debug!(
            projection = %projection,
            partition = %partition,
            exit = ?exit,
            "Partition worker finished"
        );
        exit
    }

    async fn process(&mut self, item: QueuedEvent) -> EventResult {
        let QueuedEvent {
            position,
            envelope,
            handler,
        } = item;

        let semaphore = Arc::clone(&self.shared.semaphore);
        let _permit = tokio::select! {
            biased;
            () = self.shutdown.immediate() => return EventResult::Abandoned,
            permit = semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return EventResult::Abandoned,
            },
        };

        let projection = &self.shared.projection;
        let ctx = ProjectionContext::new(
            Arc::clone(projection),
            Arc::clone(&self.partition),
            position,
            ProcessingMode::Live,
            self.shutdown.clone(),
        );

        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let result = handler
                .invoke(envelope.clone(), ctx.clone().with_attempt(attempt))
                .await;
            metrics::record_handler_duration(projection, started.elapsed());

            let outcome = self.shared.policy.classify(result, attempt);
            let error = outcome.error().map(ToString::to_string).unwrap_or_default();

            match self.shared.policy.decide(&outcome, attempt) {
                PolicyDecision::Complete => return EventResult::Processed,
                PolicyDecision::Retry { delay } => {
                    tracing::warn!(
                        projection = %projection,
                        partition = %self.partition,
                        position,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "Handler failed, retrying"
                    );
                    metrics::record_retry(projection);

                    let shutdown = &mut self.shutdown;
                    tokio::select! {
                        biased;
                        () = shutdown.immediate() => return EventResult::Abandoned,
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                PolicyDecision::Skip => {
                    tracing::warn!(
                        projection = %projection,
                        partition = %self.partition,
                        position,
                        attempt,
                        error = %error,
                        "Handler failed, skipping event"
                    );
                    return EventResult::Skipped;
                }
                PolicyDecision::Stop => {
                    tracing::error!(
                        projection = %projection,
                        partition = %self.partition,
                        position,
                        attempt,
                        error = %error,
                        "Handler failed, stopping partition"
                    );
                    return EventResult::Stopped;
                }
            }
        }
    }

    async fn complete(&mut self, position: u64, skipped: bool) {
        let monitor = &self.shared.monitor;
        monitor.record_event_processed(&self.shared.projection, &self.partition, position);
        if skipped {
            monitor.record_event_skipped(&self.shared.projection, Some(&self.partition));
        }

        if self.batcher.record(position) {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        match self.batcher.flush(self.shared.checkpoints.as_ref()).await {
            Ok(Some(position)) => {
                self.shared
                    .monitor
                    .record_checkpoint_written(&self.shared.projection, &self.partition, position);
                tracing::debug!(
                    projection = %self.shared.projection,
                    partition = %self.partition,
                    position,
                    "Checkpoint saved"
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(
                    projection = %self.shared.projection,
                    partition = %self.partition,
                    key = %self.batcher.key(),
                    error = %e,
                    "Failed to save checkpoint"
                );
            }
        }
    }

    fn halt(&self, position: u64) {
        let discarded = self.queue.stop();
        let monitor = &self.shared.monitor;
        for _ in 0..discarded {
            monitor.record_event_dropped(&self.shared.projection, &self.partition);
        }
        monitor.record_worker_stopped(&self.shared.projection, Some(&self.partition));
        tracing::error!(
            projection = %self.shared.projection,
            partition = %self.partition,
            position,
            discarded,
            "Partition worker stopped; restart required to resume"
        );
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::monitor::InMemoryProjectionMonitor;
    use crate::registry::{HandlerRegistry, RegisteredHandler};
    use foldline_core::error::{ProjectionError, Result};
    use foldline_core::event::{EventEnvelope, EventType};
    use foldline_core::options::{BackpressureStrategy, ErrorHandlingOptions, FallbackStrategy, ProjectionOptions};
    use foldline_core::projection::ProjectionHandler;
    use foldline_core::shutdown::shutdown_channel;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Tick(u64);

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u64>>,
        fail_on: Option<u64>,
    }

    impl ProjectionHandler<Tick> for Recorder {
        async fn project(&self, event: &Tick, ctx: &ProjectionContext) -> Result<()> {
            if self.fail_on == Some(event.0) {
                return Err(ProjectionError::processing("bad tick"));
            }
            self.seen.lock().unwrap().push(ctx.position());
            Ok(())
        }
    }

    fn setup(
        recorder: Arc<Recorder>,
        errors: ErrorHandlingOptions,
        batch: u64,
    ) -> (Arc<WorkerShared>, Arc<RegisteredHandler>, Arc<InMemoryCheckpointStore>) {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<Tick, _>("ticks", recorder, ProjectionOptions::default())
            .unwrap();
        let handler = registry.get_handlers(EventType::of::<Tick>())[0].clone();
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let shared = Arc::new(WorkerShared {
            projection: Arc::from("ticks"),
            semaphore: Arc::new(Semaphore::new(1)),
            policy: ErrorPolicy::new(errors),
            checkpoint_batch_size: batch,
            checkpoints: checkpoints.clone(),
            monitor: Arc::new(InMemoryProjectionMonitor::new()),
            active_workers: AtomicUsize::new(1),
        });
        (shared, handler, checkpoints)
    }

    #[tokio::test]
    async fn drains_in_order_and_flushes_the_tail() {
        let recorder = Arc::new(Recorder::default());
        let (shared, handler, checkpoints) = setup(recorder.clone(), ErrorHandlingOptions::skip(), 2);
        let queue = Arc::new(PartitionQueue::new(8, BackpressureStrategy::Block, 0));
        for n in 0..3 {
            queue.push(EventEnvelope::new(Tick(n)), handler.clone()).await;
        }
        queue.close();

        let worker = PartitionWorker::new(shared, Arc::from("_default"), queue, ShutdownSignal::never());
        assert_eq!(worker.run().await, WorkerExit::Drained);

        assert_eq!(*recorder.seen.lock().unwrap(), vec![0, 1, 2]);
        let key = CheckpointKey::for_projection("ticks");
        assert_eq!(checkpoints.get_checkpoint(&key).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn stop_halts_before_the_failed_position() {
        let recorder = Arc::new(Recorder {
            fail_on: Some(1),
            ..Recorder::default()
        });
        let errors = ErrorHandlingOptions::retry(2, FallbackStrategy::Stop)
            .with_delays(Duration::from_millis(1), Duration::from_millis(2));
        let (shared, handler, checkpoints) = setup(recorder.clone(), errors, 10);
        let queue = Arc::new(PartitionQueue::new(8, BackpressureStrategy::Block, 0));
        for n in 0..3 {
            queue.push(EventEnvelope::new(Tick(n)), handler.clone()).await;
        }

        let worker = PartitionWorker::new(shared, Arc::from("_default"), queue.clone(), ShutdownSignal::never());
        assert_eq!(worker.run().await, WorkerExit::Stopped { position: 1 });

        assert_eq!(*recorder.seen.lock().unwrap(), vec![0]);
        assert!(queue.is_stopped());
        let key = CheckpointKey::for_projection("ticks");
        assert_eq!(checkpoints.get_checkpoint(&key).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn immediate_shutdown_interrupts_backoff() {
        let recorder = Arc::new(Recorder {
            fail_on: Some(0),
            ..Recorder::default()
        });
        let errors = ErrorHandlingOptions::retry(5, FallbackStrategy::Skip)
            .with_delays(Duration::from_secs(30), Duration::from_secs(30));
        let (shared, handler, _checkpoints) = setup(recorder, errors, 10);
        let queue = Arc::new(PartitionQueue::new(8, BackpressureStrategy::Block, 0));
        queue.push(EventEnvelope::new(Tick(0)), handler).await;

        let (handle, signal) = shutdown_channel();
        let worker = PartitionWorker::new(shared, Arc::from("_default"), queue, signal);
        let running = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();

        let exit = tokio::time::timeout(Duration::from_secs(1), running).await.unwrap().unwrap();
        assert_eq!(exit, WorkerExit::Abandoned);
    }
}
