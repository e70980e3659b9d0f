//! # Foldline Core
//!
//! Core traits and types for building read-model projections from a stream of
//! domain events.
//!
//! This crate defines the contracts the projection engine works against. It
//! contains no engine logic; the engine lives in `foldline-projections`.
//!
//! ## Core Concepts
//!
//! - **Event**: An opaque typed payload, carried through the engine as an [`EventEnvelope`]
//! - **Projection handler**: Folds events into queryable read-model state
//! - **Partition**: An ordering domain; events sharing a key are handled in order
//! - **Checkpoint**: The last durably recorded processed position
//! - **Event source / event store**: Live and historical event collaborators
//!
//! ## Example
//!
//! ```ignore
//! use foldline_core::prelude::*;
//!
//! #[derive(Clone, Debug)]
//! struct AccountCredited { account: String, amount: u64 }
//!
//! struct BalanceProjection { /* read model handle */ }
//!
//! impl ProjectionHandler<AccountCredited> for BalanceProjection {
//!     async fn project(&self, event: &AccountCredited, ctx: &ProjectionContext) -> Result<()> {
//!         // Update read model
//!         Ok(())
//!     }
//! }
//!
//! impl PartitionedHandler<AccountCredited> for BalanceProjection {
//!     fn partition_key(&self, event: &AccountCredited) -> Result<String> {
//!         Ok(event.account.clone())
//!     }
//! }
//! ```

pub mod checkpoint;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod event_store;
pub mod options;
pub mod projection;
pub mod shutdown;

pub use checkpoint::{CheckpointKey, CheckpointStore};
pub use error::{ProjectionError, Result};
pub use event::{Event, EventEnvelope, EventType, StoredEvent};
pub use event_bus::{EventBusError, EventSource, EventStream};
pub use event_store::{EventStore, EventStoreError, StoredEventStream};
pub use options::{
    BackpressureStrategy, CheckpointMode, ErrorHandlingOptions, ErrorStrategy, FallbackStrategy,
    ProjectionOptions, ReplayOptions, StartupMode,
};
pub use projection::{
    DEFAULT_PARTITION, PartitionedHandler, ProcessingMode, ProjectionContext, ProjectionHandler,
};
pub use shutdown::{ShutdownHandle, ShutdownMode, ShutdownSignal, shutdown_channel};

/// Commonly used imports for projection authors.
pub mod prelude {
    pub use crate::error::{ProjectionError, Result};
    pub use crate::event::{Event, EventEnvelope};
    pub use crate::options::{ErrorHandlingOptions, ProjectionOptions};
    pub use crate::projection::{
        PartitionedHandler, ProcessingMode, ProjectionContext, ProjectionHandler,
    };
}
