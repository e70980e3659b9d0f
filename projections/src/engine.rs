//! `ProjectionEngine`: live event processing for every registered projection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  one subscription per event type
//! │ Event Source │ ─────────────────────────────────┐
//! └──────────────┘                                  ▼
//!                                        ┌────────────────────┐
//!                                        │ ingestion loop     │
//!                                        │  route ─▶ enqueue  │
//!                                        └─────────┬──────────┘
//!                         ┌────────────────────────┼───────────────────────┐
//!                         ▼                        ▼                       ▼
//!                  partition queue          partition queue         partition queue
//!                         │                        │                       │
//!                      worker ◀── semaphore (max_degree_of_parallelism) ─▶ worker
//!                         │                                                │
//!                         └──▶ error policy ──▶ checkpoint batch ──▶ monitor
//! ```
//!
//! Partitions are created lazily on the first event for an unseen key; each
//! gets a bounded queue and one sequential worker for the rest of the run.
//!
//! # Startup
//!
//! Each partition's first position comes from its [`StartupPlan`]. The live
//! transport carries no positions of its own, so `CatchUp` and `LiveOnly`
//! degrade to coarser approximations, which are logged at `warn`:
//!
//! | Startup mode | Plan                                                      |
//! |--------------|-----------------------------------------------------------|
//! | `Resume`     | `ResumeAt(checkpoint + 1)`, or `StreamStart` without one  |
//! | `Replay`     | `StreamStart`, ignoring any checkpoint                    |
//! | `CatchUp`    | `StreamStart { degraded }`                                |
//! | `LiveOnly`   | `FirstLiveEvent { degraded }`, numbered after any checkpoint |
//!
//! # Shutdown
//!
//! - Graceful: ingestion stops, queued events are drained, checkpoints flushed
//! - Immediate: ingestion stops, queued events are abandoned, backoff and
//!   permit waits are interrupted, processed positions are still flushed
//!
//! If every live stream ends, the engine shuts down gracefully on its own.
//!
//! # Example
//!
//! ```ignore
//! let engine = Arc::new(ProjectionEngine::new(Arc::new(registry), event_source));
//! let (shutdown, signal) = shutdown_channel();
//!
//! let running = tokio::spawn({
//!     let engine = Arc::clone(&engine);
//!     async move { engine.run(signal).await }
//! });
//!
//! tokio::signal::ctrl_c().await?;
//! shutdown.shutdown();
//! running.await??;
//! ```

use crate::checkpoint::InMemoryCheckpointStore;
use crate::monitor::{InMemoryProjectionMonitor, ProjectionMonitor};
use crate::policy::{ErrorPolicy, PolicyDecision};
use crate::queue::{PartitionQueue, PushOutcome};
use crate::registry::{HandlerRegistry, RegisteredHandler};
use crate::router;
use crate::worker::{PartitionWorker, WorkerExit, WorkerShared};
use foldline_core::checkpoint::{CheckpointKey, CheckpointStore};
use foldline_core::error::{ProjectionError, Result};
use foldline_core::event::{EventEnvelope, EventType};
use foldline_core::event_bus::{EventSource, EventStream};
use foldline_core::options::{BackpressureStrategy, ProjectionOptions, StartupMode};
use foldline_core::shutdown::{ShutdownMode, ShutdownSignal};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Where a partition starts consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPlan {
    /// Continue after a stored checkpoint
    ResumeAt(u64),
    /// Start numbering at position 0
    StreamStart {
        /// `true` when this approximates a mode the transport cannot honour
        degraded: bool,
    },
    /// Process only events received after subscription
    FirstLiveEvent {
        /// Position assigned to the first live event
        next_position: u64,
        /// `true` when this approximates a mode the transport cannot honour
        degraded: bool,
    },
}

impl StartupPlan {
    /// Resolve a plan from the startup mode and the stored checkpoint.
    #[must_use]
    pub const fn resolve(mode: StartupMode, checkpoint: Option<u64>) -> Self {
        match (mode, checkpoint) {
            (StartupMode::Resume, Some(position)) => Self::ResumeAt(position.saturating_add(1)),
            (StartupMode::Resume | StartupMode::Replay, _) => Self::StreamStart { degraded: false },
            (StartupMode::CatchUp, _) => Self::StreamStart { degraded: true },
            (StartupMode::LiveOnly, checkpoint) => Self::FirstLiveEvent {
                next_position: match checkpoint {
                    Some(position) => position.saturating_add(1),
                    None => 0,
                },
                degraded: true,
            },
        }
    }

    /// Position assigned to the partition's first event.
    #[must_use]
    pub const fn first_position(&self) -> u64 {
        match self {
            Self::ResumeAt(position) | Self::FirstLiveEvent { next_position: position, .. } => *position,
            Self::StreamStart { .. } => 0,
        }
    }

    /// Returns `true` if the plan approximates the requested mode.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        match self {
            Self::ResumeAt(_) => false,
            Self::StreamStart { degraded } | Self::FirstLiveEvent { degraded, .. } => *degraded,
        }
    }
}

async fn resolve_startup_plan(
    projection: &str,
    partition: &str,
    options: &ProjectionOptions,
    checkpoints: &dyn CheckpointStore,
) -> Result<StartupPlan> {
    let checkpoint = match options.startup_mode {
        StartupMode::Resume | StartupMode::LiveOnly => {
            let key = CheckpointKey::for_partition(projection, partition);
            checkpoints.get_checkpoint(&key).await?
        }
        StartupMode::Replay | StartupMode::CatchUp => None,
    };
    Ok(StartupPlan::resolve(options.startup_mode, checkpoint))
}

/// Runs every registered projection against a live event source.
pub struct ProjectionEngine {
    registry: Arc<HandlerRegistry>,
    source: Arc<dyn EventSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    monitor: Arc<dyn ProjectionMonitor>,
}

impl ProjectionEngine {
    /// Create an engine with the in-memory checkpoint store and monitor.
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry>, source: Arc<dyn EventSource>) -> Self {
        Self {
            registry,
            source,
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            monitor: Arc::new(InMemoryProjectionMonitor::new()),
        }
    }

    /// Use a different checkpoint store.
    #[must_use]
    pub fn with_checkpoint_store(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// Use a different monitor.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<dyn ProjectionMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// The registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// The checkpoint store.
    #[must_use]
    pub const fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// The monitor.
    #[must_use]
    pub const fn monitor(&self) -> &Arc<dyn ProjectionMonitor> {
        &self.monitor
    }

    /// The plan a partition would start with if it were created now.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Registration`] for an unknown projection, or
    /// the checkpoint store's error.
    pub async fn startup_plan(&self, projection: &str, partition: &str) -> Result<StartupPlan> {
        let options = self.registry.projection_options(projection).ok_or_else(|| {
            ProjectionError::Registration(format!("unknown projection '{projection}'"))
        })?;
        resolve_startup_plan(projection, partition, options, self.checkpoints.as_ref()).await
    }

    /// Run until shutdown is requested or every live stream ends.
    ///
    /// Handler failures never surface here; they are resolved by each
    /// projection's error policy and reported through logs and the monitor.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::EventBus`] if a subscription cannot be
    /// created. No event has been processed when this happens.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<()> {
        let event_types = self.registry.event_types();
        if event_types.is_empty() {
            tracing::info!("No projections registered, projection engine has nothing to run");
            return Ok(());
        }

        let runtimes: HashMap<&str, Arc<ProjectionRuntime>> = self
            .registry
            .projection_names()
            .into_iter()
            .filter_map(|name| {
                let options = self.registry.projection_options(name)?;
                let runtime = ProjectionRuntime::new(
                    name,
                    options.clone(),
                    Arc::clone(&self.checkpoints),
                    Arc::clone(&self.monitor),
                    shutdown.clone(),
                );
                Some((name, Arc::new(runtime)))
            })
            .collect();

        let mut subscriptions = Vec::with_capacity(event_types.len());
        for event_type in event_types {
            let stream = self.source.subscribe(event_type).await.map_err(|e| {
                tracing::error!(event_type = %event_type, error = %e, "Failed to subscribe");
                ProjectionError::from(e)
            })?;

            let targets: Vec<Target> = self
                .registry
                .get_handlers(event_type)
                .iter()
                .filter_map(|handler| {
                    let runtime = runtimes.get(handler.projection_name())?;
                    Some((Arc::clone(handler), Arc::clone(runtime)))
                })
                .collect();
            subscriptions.push((event_type, stream, targets));
        }

        tracing::info!(
            projections = runtimes.len(),
            subscriptions = subscriptions.len(),
            "Projection engine started"
        );

        let ingestion: Vec<_> = subscriptions
            .into_iter()
            .map(|(event_type, stream, targets)| {
                tokio::spawn(ingest(event_type, stream, targets, shutdown.clone()))
            })
            .collect();
        for joined in futures::future::join_all(ingestion).await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Subscription task failed");
            }
        }

        let mode = shutdown.mode();
        tracing::info!(mode = ?mode, "Projection engine stopping");
        for runtime in runtimes.values() {
            runtime.shutdown(mode).await;
        }

        tracing::info!("Projection engine stopped");
        Ok(())
    }
}

type Target = (Arc<RegisteredHandler>, Arc<ProjectionRuntime>);

async fn ingest(event_type: EventType, mut stream: EventStream, targets: Vec<Target>, mut shutdown: ShutdownSignal) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            None => {
                tracing::info!(event_type = %event_type, "Event stream ended");
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(event_type = %event_type, error = %e, "Error receiving event, skipping");
            }
            Some(Ok(envelope)) => {
                for (handler, runtime) in &targets {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return,
                        () = runtime.dispatch(handler, envelope.clone()) => {}
                    }
                }
            }
        }
    }
}

/// One projection's partitions and workers for the duration of a run.
struct ProjectionRuntime {
    name: Arc<str>,
    options: ProjectionOptions,
    shared: Arc<WorkerShared>,
    partitions: Mutex<HashMap<String, Arc<PartitionQueue>>>,
    workers: Mutex<Vec<(Arc<str>, JoinHandle<WorkerExit>)>>,
    stopped_handlers: Mutex<HashSet<u64>>,
    shutdown: ShutdownSignal,
}

impl ProjectionRuntime {
    fn new(
        name: &str,
        options: ProjectionOptions,
        checkpoints: Arc<dyn CheckpointStore>,
        monitor: Arc<dyn ProjectionMonitor>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let name: Arc<str> = Arc::from(name);
        let shared = Arc::new(WorkerShared {
            projection: Arc::clone(&name),
            semaphore: Arc::new(Semaphore::new(options.max_degree_of_parallelism)),
            policy: ErrorPolicy::new(options.error_handling.clone()),
            checkpoint_batch_size: options.checkpoint_batch_size,
            checkpoints,
            monitor,
            active_workers: AtomicUsize::new(0),
        });
        Self {
            name,
            options,
            shared,
            partitions: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            stopped_handlers: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    fn monitor(&self) -> &dyn ProjectionMonitor {
        self.shared.monitor.as_ref()
    }

    fn is_handler_stopped(&self, handler: &RegisteredHandler) -> bool {
        self.stopped_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&handler.id())
    }

    async fn dispatch(&self, handler: &Arc<RegisteredHandler>, envelope: EventEnvelope) {
        if self.is_handler_stopped(handler) {
            tracing::trace!(
                projection = %self.name,
                event_type = %handler.event_type(),
                "Handler stopped, ignoring event"
            );
            return;
        }

        let key = match router::partition_key(handler, &envelope) {
            Ok(key) => key,
            Err(e) => {
                self.on_partitioning_failure(handler, &e);
                return;
            }
        };

        let queue = self.partition(&key).await;
        if self.options.backpressure == BackpressureStrategy::Block && queue.len() >= queue.capacity() {
            let saturated = ProjectionError::QueueSaturated {
                projection: self.name.to_string(),
                partition: key.clone(),
            };
            tracing::warn!(error = %saturated, strategy = "block", "Waiting for a free slot");
        }

        match queue.push(envelope, Arc::clone(handler)).await {
            PushOutcome::Enqueued { position, depth } => {
                self.monitor().record_queue_depth(&self.name, &key, depth);
                self.monitor().record_lag(&self.name, &key, position, None);
            }
            PushOutcome::DroppedNewest => {
                let saturated = ProjectionError::QueueSaturated {
                    projection: self.name.to_string(),
                    partition: key.clone(),
                };
                tracing::warn!(error = %saturated, strategy = "drop_newest", "Dropped incoming event");
                self.monitor().record_event_dropped(&self.name, &key);
            }
            PushOutcome::DroppedOldest { evicted, position } => {
                let saturated = ProjectionError::QueueSaturated {
                    projection: self.name.to_string(),
                    partition: key.clone(),
                };
                tracing::warn!(
                    error = %saturated,
                    strategy = "drop_oldest",
                    evicted,
                    "Evicted oldest queued event"
                );
                self.monitor().record_event_dropped(&self.name, &key);
                self.monitor().record_lag(&self.name, &key, position, None);
            }
            PushOutcome::Stopped => {
                let stopped = ProjectionError::WorkerStopped {
                    projection: self.name.to_string(),
                    partition: key.clone(),
                };
                tracing::warn!(error = %stopped, "Rejected event");
                self.monitor().record_event_dropped(&self.name, &key);
            }
            PushOutcome::Closed => {
                tracing::debug!(projection = %self.name, partition = %key, "Queue closed, event not accepted");
            }
        }
    }

    fn on_partitioning_failure(&self, handler: &RegisteredHandler, error: &ProjectionError) {
        match self.shared.policy.terminal_decision() {
            PolicyDecision::Stop => {
                self.stopped_handlers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(handler.id());
                self.monitor().record_worker_stopped(&self.name, None);
                tracing::error!(
                    projection = %self.name,
                    event_type = %handler.event_type(),
                    error = %error,
                    "Partition key failed, stopping ingestion for handler"
                );
            }
            _ => {
                self.monitor().record_event_skipped(&self.name, None);
                tracing::warn!(
                    projection = %self.name,
                    event_type = %handler.event_type(),
                    error = %error,
                    "Partition key failed, skipping event"
                );
            }
        }
    }

    fn existing_partition(&self, key: &str) -> Option<Arc<PartitionQueue>> {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(Arc::clone)
    }

    /// The queue for `key`, starting its worker on first use.
    ///
    /// The startup plan is resolved without holding the partition map, so a
    /// slow checkpoint load only delays events for the new partition.
    async fn partition(&self, key: &str) -> Arc<PartitionQueue> {
        if let Some(queue) = self.existing_partition(key) {
            return queue;
        }

        let plan = match resolve_startup_plan(&self.name, key, &self.options, self.shared.checkpoints.as_ref()).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(
                    projection = %self.name,
                    partition = %key,
                    error = %e,
                    "Failed to load checkpoint, starting from stream start"
                );
                StartupPlan::StreamStart { degraded: true }
            }
        };
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(queue) = partitions.get(key) {
            return Arc::clone(queue);
        }

        if plan.is_degraded() {
            tracing::warn!(
                projection = %self.name,
                partition = %key,
                startup_mode = ?self.options.startup_mode,
                plan = ?plan,
                "Startup mode degraded on live transport"
            );
        } else {
            tracing::info!(projection = %self.name, partition = %key, plan = ?plan, "Partition started");
        }

        let queue = Arc::new(PartitionQueue::new(
            self.options.channel_capacity,
            self.options.backpressure,
            plan.first_position(),
        ));
        partitions.insert(key.to_string(), Arc::clone(&queue));
        drop(partitions);

        let partition: Arc<str> = Arc::from(key);
        let count = self.shared.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
        let worker = PartitionWorker::new(
            Arc::clone(&self.shared),
            Arc::clone(&partition),
            Arc::clone(&queue),
            self.shutdown.clone(),
        );
        let handle = tokio::spawn(worker.run());
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((partition, handle));
        self.monitor().record_worker_count(&self.name, count);

        queue
    }

    async fn shutdown(&self, mode: ShutdownMode) {
        let queues: Vec<_> = self
            .partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, queue)| (key.clone(), Arc::clone(queue)))
            .collect();

        for (key, queue) in queues {
            if mode == ShutdownMode::Immediate {
                let abandoned = queue.abandon();
                if abandoned > 0 {
                    tracing::warn!(
                        projection = %self.name,
                        partition = %key,
                        abandoned,
                        "Abandoned queued events"
                    );
                }
            } else {
                queue.close();
            }
        }

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for (partition, handle) in workers {
            match handle.await {
                Ok(WorkerExit::Stopped { position }) => tracing::info!(
                    projection = %self.name,
                    partition = %partition,
                    position,
                    "Partition was stopped at position"
                ),
                Ok(WorkerExit::Drained | WorkerExit::Abandoned) => {}
                Err(e) => tracing::error!(
                    projection = %self.name,
                    partition = %partition,
                    error = %e,
                    "Partition worker failed"
                ),
            }
        }
    }
}
