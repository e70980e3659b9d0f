//! Projection handlers and the context they run in.
//!
//! # Overview
//!
//! A projection folds events into a read model. Each projection is made of one
//! or more handlers, one per event type it consumes, all sharing a projection
//! name, options, and checkpoints.
//!
//! ## Partitions
//!
//! A partition is an ordering domain. Events that share a partition key are
//! handed to the projection strictly in position order, one at a time. Events
//! in different partitions may be processed concurrently, up to the
//! projection's `max_degree_of_parallelism`.
//!
//! Handlers that only implement [`ProjectionHandler`] run in the
//! [`DEFAULT_PARTITION`]. Handlers that also implement [`PartitionedHandler`]
//! supply a key per event.
//!
//! ```text
//!   event ──▶ partition_key(event) ──▶ ┌──────────────┐
//!                                      │ "acct-1" q   │──▶ worker ─┐
//!                                      ├──────────────┤            │  semaphore
//!                                      │ "acct-2" q   │──▶ worker ─┤  (N permits)
//!                                      └──────────────┘            ▼
//!                                                              project()
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use foldline_core::prelude::*;
//!
//! struct AccountBalances {
//!     store: Arc<BalanceStore>,
//! }
//!
//! impl ProjectionHandler<AccountCredited> for AccountBalances {
//!     async fn project(&self, event: &AccountCredited, ctx: &ProjectionContext) -> Result<()> {
//!         if ctx.mode().is_dry_run() {
//!             return Ok(());
//!         }
//!         self.store.credit(&event.account, event.amount).await
//!     }
//! }
//!
//! impl PartitionedHandler<AccountCredited> for AccountBalances {
//!     fn partition_key(&self, event: &AccountCredited) -> Result<String> {
//!         Ok(event.account.clone())
//!     }
//! }
//! ```

use crate::error::Result;
use crate::event::Event;
use crate::shutdown::ShutdownSignal;
use std::future::Future;
use std::sync::Arc;

/// Partition key used by handlers without a partition function.
pub const DEFAULT_PARTITION: &str = "_default";

/// Whether an invocation comes from the live engine or from a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Live event from a subscription
    Live,
    /// Historical event from a replay
    Replay {
        /// Checkpoints will not be written for this replay
        dry_run: bool,
    },
}

impl ProcessingMode {
    /// Returns `true` for replayed events.
    #[must_use]
    pub const fn is_replay(&self) -> bool {
        matches!(self, Self::Replay { .. })
    }

    /// Returns `true` for dry-run replays.
    #[must_use]
    pub const fn is_dry_run(&self) -> bool {
        matches!(self, Self::Replay { dry_run: true })
    }
}

/// Context for a single handler invocation.
#[derive(Debug, Clone)]
pub struct ProjectionContext {
    projection_name: Arc<str>,
    partition_key: Arc<str>,
    position: u64,
    attempt: u32,
    mode: ProcessingMode,
    shutdown: ShutdownSignal,
}

impl ProjectionContext {
    /// Create a context for the first attempt at an event.
    #[must_use]
    pub fn new(
        projection_name: Arc<str>,
        partition_key: Arc<str>,
        position: u64,
        mode: ProcessingMode,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            projection_name,
            partition_key,
            position,
            attempt: 1,
            mode,
            shutdown,
        }
    }

    /// The same context, for a later attempt.
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Name of the projection being invoked.
    #[must_use]
    pub fn projection_name(&self) -> &str {
        &self.projection_name
    }

    /// Partition the event was routed to.
    #[must_use]
    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    /// Position of the event.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Attempt number, starting at 1.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Live or replay.
    #[must_use]
    pub const fn mode(&self) -> ProcessingMode {
        self.mode
    }

    /// The run's shutdown signal, for cooperative cancellation of long work.
    #[must_use]
    pub const fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }
}

/// Folds events of type `E` into a read model.
///
/// Handlers should be idempotent: events may be seen again after a restart
/// from a checkpoint, during a replay, or on retry.
///
/// # Errors
///
/// A handler reports failure by returning an error (normally
/// [`ProjectionError::EventProcessing`](crate::ProjectionError::EventProcessing)).
/// The engine's error policy decides whether to retry, skip, or stop.
pub trait ProjectionHandler<E: Event>: Send + Sync + 'static {
    /// Apply one event.
    fn project(&self, event: &E, ctx: &ProjectionContext) -> impl Future<Output = Result<()>> + Send;
}

/// A handler whose events are partitioned by a key.
pub trait PartitionedHandler<E: Event>: ProjectionHandler<E> {
    /// Compute the partition key for an event.
    ///
    /// Must be a pure function of the event.
    ///
    /// # Errors
    ///
    /// A failure is treated as a processing failure for this event.
    fn partition_key(&self, event: &E) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_tracks_attempts() {
        let ctx = ProjectionContext::new(
            Arc::from("balances"),
            Arc::from(DEFAULT_PARTITION),
            7,
            ProcessingMode::Live,
            ShutdownSignal::never(),
        );
        assert_eq!(ctx.attempt(), 1);
        assert_eq!(ctx.position(), 7);
        assert_eq!(ctx.projection_name(), "balances");

        let retry = ctx.with_attempt(3);
        assert_eq!(retry.attempt(), 3);
        assert_eq!(retry.partition_key(), DEFAULT_PARTITION);
    }

    #[test]
    fn processing_mode_flags() {
        assert!(!ProcessingMode::Live.is_replay());
        assert!(ProcessingMode::Replay { dry_run: false }.is_replay());
        assert!(!ProcessingMode::Replay { dry_run: false }.is_dry_run());
        assert!(ProcessingMode::Replay { dry_run: true }.is_dry_run());
    }
}
