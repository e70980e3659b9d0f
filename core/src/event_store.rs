//! Historical event store abstraction used by replay.
//!
//! The store is an optional collaborator. Replay reads a projection's stream
//! (the stream name is the projection name) in ascending position order,
//! starting at an inclusive position.
//!
//! # Implementations
//!
//! - `InMemoryEventStore` (in `foldline-testing`): fast, deterministic testing
//!
//! Durable backends are supplied by the application.
//!
//! # Example
//!
//! ```no_run
//! use foldline_core::event::EventEnvelope;
//! use foldline_core::event_store::{EventStore, EventStoreError};
//! use futures::StreamExt;
//!
//! async fn example<S: EventStore>(store: &S) -> Result<(), EventStoreError> {
//!     let position = store.append("balances", EventEnvelope::new(42_u64)).await?;
//!
//!     let mut events = store.read("balances", position).await?;
//!     while let Some(stored) = events.next().await {
//!         let stored = stored?;
//!         println!("event at {}", stored.position);
//!     }
//!     Ok(())
//! }
//! ```

use crate::event::{EventEnvelope, StoredEvent};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event store operations.
#[derive(Error, Debug, Clone)]
pub enum EventStoreError {
    /// The store could not be reached.
    #[error("Event store unavailable: {0}")]
    Unavailable(String),

    /// Reading a stream failed part-way.
    #[error("Read failed for stream '{stream}': {reason}")]
    ReadFailed {
        /// The stream being read
        stream: String,
        /// The reason for failure
        reason: String,
    },

    /// Appending to a stream failed.
    #[error("Append failed for stream '{stream}': {reason}")]
    AppendFailed {
        /// The stream being appended to
        stream: String,
        /// The reason for failure
        reason: String,
    },
}

/// Ordered stream of stored events.
pub type StoredEventStream =
    Pin<Box<dyn Stream<Item = Result<StoredEvent, EventStoreError>> + Send>>;

/// A position-aware historical event store.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns so the replay
/// service can hold it as `Arc<dyn EventStore>`.
pub trait EventStore: Send + Sync {
    /// Append an event to a stream, returning its position.
    ///
    /// Positions start at 0 and increase by one per appended event.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::AppendFailed`] if the write fails.
    fn append(
        &self,
        stream: &str,
        event: EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<u64, EventStoreError>> + Send + '_>>;

    /// Read a stream in ascending position order, starting at `from_position`
    /// (inclusive).
    ///
    /// A stream that does not exist reads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError`] if the read cannot be started; errors while
    /// reading are yielded as stream items.
    fn read(
        &self,
        stream: &str,
        from_position: u64,
    ) -> Pin<Box<dyn Future<Output = Result<StoredEventStream, EventStoreError>> + Send + '_>>;
}
