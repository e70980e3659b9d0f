//! Partition routing.

use crate::registry::RegisteredHandler;
use foldline_core::error::{ProjectionError, Result};
use foldline_core::event::EventEnvelope;
use foldline_core::projection::DEFAULT_PARTITION;

/// Compute the partition key of an event for one handler.
///
/// Handlers without a key function always route to [`DEFAULT_PARTITION`].
///
/// # Errors
///
/// Returns [`ProjectionError::Partitioning`] if the key function fails or
/// returns an empty key.
pub fn partition_key(handler: &RegisteredHandler, envelope: &EventEnvelope) -> Result<String> {
    let Some(key_fn) = handler.key_fn() else {
        return Ok(DEFAULT_PARTITION.to_string());
    };

    match key_fn(envelope) {
        Ok(key) if key.is_empty() => Err(ProjectionError::Partitioning(format!(
            "empty partition key for {} in projection '{}'",
            envelope.event_type(),
            handler.projection_name()
        ))),
        Ok(key) => Ok(key),
        Err(ProjectionError::Partitioning(reason)) => Err(ProjectionError::Partitioning(reason)),
        Err(e) => Err(ProjectionError::Partitioning(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::registry::HandlerRegistry;
    use foldline_core::event::EventType;
    use foldline_core::options::ProjectionOptions;
    use foldline_core::projection::{PartitionedHandler, ProjectionContext, ProjectionHandler};
    use std::sync::Arc;

    struct Transfer {
        account: String,
    }

    struct ByAccount;

    impl ProjectionHandler<Transfer> for ByAccount {
        async fn project(&self, _event: &Transfer, _ctx: &ProjectionContext) -> Result<()> {
            Ok(())
        }
    }

    impl PartitionedHandler<Transfer> for ByAccount {
        fn partition_key(&self, event: &Transfer) -> Result<String> {
            if event.account == "broken" {
                return Err(ProjectionError::processing("no account"));
            }
            Ok(event.account.clone())
        }
    }

    fn handler(partitioned: bool) -> Arc<RegisteredHandler> {
        let mut registry = HandlerRegistry::new();
        if partitioned {
            registry
                .register_partitioned::<Transfer, _>("transfers", Arc::new(ByAccount), ProjectionOptions::default())
                .unwrap();
        } else {
            registry
                .register::<Transfer, _>("transfers", Arc::new(ByAccount), ProjectionOptions::default())
                .unwrap();
        }
        registry.get_handlers(EventType::of::<Transfer>())[0].clone()
    }

    fn transfer(account: &str) -> EventEnvelope {
        EventEnvelope::new(Transfer {
            account: account.to_string(),
        })
    }

    #[test]
    fn unpartitioned_handlers_use_the_default_partition() {
        let key = partition_key(&handler(false), &transfer("acct-1")).unwrap();
        assert_eq!(key, DEFAULT_PARTITION);
    }

    #[test]
    fn partitioned_handlers_use_their_key_function() {
        let key = partition_key(&handler(true), &transfer("acct-1")).unwrap();
        assert_eq!(key, "acct-1");
    }

    #[test]
    fn key_function_failures_are_partitioning_errors() {
        let broken = partition_key(&handler(true), &transfer("broken"));
        assert!(matches!(broken, Err(ProjectionError::Partitioning(_))));

        let empty = partition_key(&handler(true), &transfer(""));
        assert!(matches!(empty, Err(ProjectionError::Partitioning(_))));
    }
}
