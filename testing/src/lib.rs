//! # Foldline Testing
//!
//! Testing utilities for Foldline projections.
//!
//! This crate provides:
//! - [`InMemoryEventBus`]: live event source with per-subscriber ordered delivery
//! - [`InMemoryEventStore`]: historical store for replay tests
//! - [`RecordingCheckpointStore`]: checkpoint store that logs every save and reset
//! - [`MockProjection`] and [`Gate`]: scripted handlers for driving the engine
//! - [`helpers`]: polling and tracing setup for async tests
//!
//! ## Example
//!
//! ```ignore
//! use foldline_testing::{InMemoryEventBus, MockProjection, helpers};
//!
//! #[tokio::test]
//! async fn credits_are_projected_in_order() {
//!     let bus = Arc::new(InMemoryEventBus::new());
//!     let handler = Arc::new(MockProjection::<Credited>::new());
//!     registry.register::<Credited, _>("balances", handler.clone(), options)?;
//!
//!     // spawn the engine, then:
//!     bus.wait_for_subscribers(EventType::of::<Credited>(), 1).await;
//!     bus.publish(Credited { amount: 5 });
//!
//!     assert!(helpers::wait_until(Duration::from_secs(1), || handler.attempts() == 1).await);
//! }
//! ```

pub mod checkpoint;
pub mod event_bus;
pub mod event_store;
pub mod projection_mocks;

/// Test helpers and utilities.
pub mod helpers {
    use std::time::Duration;
    use tracing_subscriber::EnvFilter;

    /// Poll `condition` until it holds or `timeout` elapses.
    ///
    /// Returns whether the condition was met.
    pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Install a `tracing` subscriber for test output, filtered by `RUST_LOG`.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use checkpoint::RecordingCheckpointStore;
pub use event_bus::InMemoryEventBus;
pub use event_store::InMemoryEventStore;
pub use projection_mocks::{Gate, Invocation, MockProjection};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn wait_until_polls_until_condition_holds() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ticking = Arc::clone(&counter);

        let met = helpers::wait_until(Duration::from_secs(1), move || {
            ticking.fetch_add(1, Ordering::SeqCst) >= 3
        })
        .await;

        assert!(met);
        assert!(counter.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn wait_until_gives_up_after_timeout() {
        assert!(!helpers::wait_until(Duration::from_millis(20), || false).await);
    }
}
