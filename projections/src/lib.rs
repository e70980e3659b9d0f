//! The Foldline projection engine.
//!
//! # Overview
//!
//! This crate routes live or historical events to projection handlers:
//! - **Registry**: explicit handler registry, built once and shared read-only
//! - **Partitioning**: events sharing a partition key are handled strictly in order
//! - **Workers**: one sequential worker per partition, bounded by a per-projection
//!   parallelism cap, fed through bounded queues with configurable backpressure
//! - **Error policy**: retry with exponential backoff, skip, or stop the partition
//! - **Checkpoints**: batched position tracking per partition
//! - **Replay**: reprocess a projection's history from an event store
//! - **Monitoring**: per-partition metrics, mirrored to Prometheus
//!
//! # Data Flow
//!
//! ```text
//! Event Source ─▶ ProjectionEngine ─▶ router ─▶ partition queue ─▶ worker ─▶ handler
//!                                                                    │
//! Event Store  ─▶ ReplayService ─────────────────────────────────────┤
//!                                                                    ▼
//!                                                      checkpoint store, monitor
//! ```
//!
//! # Running Projections
//!
//! ```ignore
//! use foldline_core::shutdown::shutdown_channel;
//! use foldline_projections::{HandlerRegistry, ProjectionEngine};
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_partitioned::<AccountCredited, _>("balances", balances, options)?;
//!
//! let engine = ProjectionEngine::new(Arc::new(registry), event_source)
//!     .with_checkpoint_store(checkpoints);
//!
//! let (shutdown, signal) = shutdown_channel();
//! let running = tokio::spawn(async move { engine.run(signal).await });
//!
//! // ...
//! shutdown.shutdown();
//! running.await??;
//! ```

pub mod checkpoint;
pub mod engine;
pub mod metrics;
pub mod monitor;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod replay;
pub mod router;

mod worker;

// Re-export main types for convenience
pub use checkpoint::{CheckpointBatcher, InMemoryCheckpointStore};
pub use engine::{ProjectionEngine, StartupPlan};
pub use monitor::{InMemoryProjectionMonitor, ProjectionMetrics, ProjectionMonitor};
pub use policy::{ErrorPolicy, HandlerOutcome, PolicyDecision};
pub use registry::{HandlerRegistry, ProjectionRegistration, RegisteredHandler};
pub use replay::{ReplayReport, ReplayService};
