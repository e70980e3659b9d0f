//! Error taxonomy for the projection engine.
//!
//! Configuration and registration errors are raised synchronously, before any
//! event is read. Processing failures are reported by handlers as
//! [`ProjectionError::EventProcessing`] and resolved internally by the engine's
//! error policy; they only reach operators through logs and the monitor.

use crate::event_bus::EventBusError;
use crate::event_store::EventStoreError;

/// Error type for projection operations.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Invalid options. Raised at configuration time, never at runtime.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unknown or invalid projection registration.
    #[error("Registration error: {0}")]
    Registration(String),

    /// A handler failed to apply an event.
    #[error("Event processing error: {0}")]
    EventProcessing(String),

    /// A partition key function failed for an event.
    #[error("Partitioning error: {0}")]
    Partitioning(String),

    /// Checkpoint store failure.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// A partition queue was full when an event arrived.
    #[error("Queue saturated for projection '{projection}' partition '{partition}'")]
    QueueSaturated {
        /// Projection name
        projection: String,
        /// Partition key
        partition: String,
    },

    /// The partition's worker has stopped and no longer accepts events.
    #[error("Worker stopped for projection '{projection}' partition '{partition}'")]
    WorkerStopped {
        /// Projection name
        projection: String,
        /// Partition key
        partition: String,
    },

    /// Historical event store failure.
    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    /// Live event source failure.
    #[error(transparent)]
    EventBus(#[from] EventBusError),
}

impl ProjectionError {
    /// Convenience constructor for handler failures.
    pub fn processing(message: impl Into<String>) -> Self {
        Self::EventProcessing(message.into())
    }

    /// Returns `true` for errors that reject a call before any event is read.
    #[must_use]
    pub const fn is_configuration_error(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Registration(_))
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_saturated_display_names_partition() {
        let error = ProjectionError::QueueSaturated {
            projection: "balances".to_string(),
            partition: "acct-1".to_string(),
        };

        let display = format!("{error}");
        assert!(display.contains("balances"));
        assert!(display.contains("acct-1"));
    }

    #[test]
    fn configuration_and_registration_are_synchronous_errors() {
        assert!(ProjectionError::Configuration("x".into()).is_configuration_error());
        assert!(ProjectionError::Registration("x".into()).is_configuration_error());
        assert!(!ProjectionError::processing("boom").is_configuration_error());
    }

    #[test]
    fn store_errors_convert() {
        let error: ProjectionError = EventStoreError::Unavailable("down".into()).into();
        assert!(matches!(error, ProjectionError::EventStore(_)));
    }
}
