//! Live event source abstraction.
//!
//! The projection engine consumes live events through the [`EventSource`]
//! trait. The transport-level fan-out itself is a collaborator: the engine only
//! assumes that each subscriber receives its own ordered sequence of events,
//! in publish order.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  publish   ┌──────────────┐
//! │  Producers  │ ─────────▶ │ Event Source │
//! └─────────────┘            └──────┬───────┘
//!                                   │ one ordered stream per
//!                                   │ (subscriber, event type)
//!                     ┌─────────────┼─────────────┐
//!                     ▼             ▼             ▼
//!               subscription  subscription  subscription
//!                  loop           loop          loop
//! ```
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (in `foldline-testing`): in-process pub/sub for tests
//!
//! # Example
//!
//! ```rust,ignore
//! use foldline_core::event::EventType;
//! use futures::StreamExt;
//!
//! let mut stream = source.subscribe(EventType::of::<OrderPlaced>()).await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(envelope) => route(envelope),
//!         Err(e) => tracing::error!("Stream error: {e}"),
//!     }
//! }
//! ```

use crate::event::{EventEnvelope, EventType};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during live event source operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event source
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to subscribe to an event type
    #[error("Subscription failed for event type '{event_type}': {reason}")]
    SubscriptionFailed {
        /// The event type that failed
        event_type: String,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error while receiving
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Stream of live events for one subscription.
///
/// Dropping the stream ends the subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope, EventBusError>> + Send>>;

/// A live event source.
///
/// Each call to [`EventSource::subscribe`] creates an independent subscription
/// that yields events of the requested type in publish order.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns so it can be used as
/// `Arc<dyn EventSource>` by the engine.
pub trait EventSource: Send + Sync {
    /// Subscribe to events of a single type.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the subscription cannot
    /// be created.
    fn subscribe(
        &self,
        event_type: EventType,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_failed_display() {
        let error = EventBusError::SubscriptionFailed {
            event_type: "OrderPlaced".to_string(),
            reason: "closed".to_string(),
        };

        let display = format!("{error}");
        assert!(display.contains("OrderPlaced"));
        assert!(display.contains("closed"));
    }
}
