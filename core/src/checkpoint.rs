//! Checkpoint tracking for projection progress.
//!
//! A checkpoint is the last durably recorded processed position for a
//! projection, or for one partition of a projection. Absence means the
//! projection (or partition) has never been checkpointed.
//!
//! # Keys
//!
//! - `projection` for the projection as a whole, and for its `_default` partition
//! - `projection:partition` for any other partition
//!
//! # Checkpoint Strategy
//!
//! The engine batches writes: it saves after every `checkpoint_batch_size`
//! events processed within a partition, and flushes any partial trailing batch
//! on graceful shutdown or stream exhaustion.

use crate::error::Result;
use crate::projection::DEFAULT_PARTITION;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Key under which a checkpoint is stored.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointKey(String);

impl CheckpointKey {
    /// Key for a whole projection.
    ///
    /// # Example
    ///
    /// ```
    /// use foldline_core::checkpoint::CheckpointKey;
    ///
    /// assert_eq!(CheckpointKey::for_projection("balances").as_str(), "balances");
    /// ```
    #[must_use]
    pub fn for_projection(projection_name: &str) -> Self {
        Self(projection_name.to_string())
    }

    /// Key for one partition of a projection.
    ///
    /// The `_default` partition shares the projection key, so non-partitioned
    /// projections and replays without a partition filter read the same
    /// checkpoint.
    ///
    /// # Example
    ///
    /// ```
    /// use foldline_core::checkpoint::CheckpointKey;
    ///
    /// assert_eq!(CheckpointKey::for_partition("balances", "acct-1").as_str(), "balances:acct-1");
    /// assert_eq!(CheckpointKey::for_partition("balances", "_default").as_str(), "balances");
    /// ```
    #[must_use]
    pub fn for_partition(projection_name: &str, partition_key: &str) -> Self {
        if partition_key == DEFAULT_PARTITION {
            Self::for_projection(projection_name)
        } else {
            Self(format!("{projection_name}:{partition_key}"))
        }
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CheckpointKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Persistent storage for checkpoints.
///
/// All operations must be safe for concurrent use across distinct keys.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of
/// `impl Future` so it can be shared as `Arc<dyn CheckpointStore>` by the
/// engine, its partition workers and the replay service.
pub trait CheckpointStore: Send + Sync {
    /// Load the last saved position for a key.
    ///
    /// # Returns
    ///
    /// - `Some(position)` if a checkpoint exists
    /// - `None` if the key has never been checkpointed
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`](crate::ProjectionError::Checkpoint) if the load fails.
    fn get_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u64>>> + Send + '_>>;

    /// Save the last processed position for a key.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`](crate::ProjectionError::Checkpoint) if the save fails.
    fn save_checkpoint(
        &self,
        key: &CheckpointKey,
        position: u64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Remove the checkpoint for a key.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`](crate::ProjectionError::Checkpoint) if the reset fails.
    fn reset_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_keys_are_namespaced_by_projection() {
        let a = CheckpointKey::for_partition("balances", "acct-1");
        let b = CheckpointKey::for_partition("statements", "acct-1");

        assert_ne!(a, b);
        assert_eq!(a.to_string(), "balances:acct-1");
    }

    #[test]
    fn default_partition_uses_projection_key() {
        assert_eq!(
            CheckpointKey::for_partition("balances", DEFAULT_PARTITION),
            CheckpointKey::for_projection("balances")
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn partition_keys_are_distinct_from_the_projection_key(
                projection in "[a-z]{1,12}",
                partition in "[a-z0-9-]{1,12}",
            ) {
                prop_assume!(partition != DEFAULT_PARTITION);
                let key = CheckpointKey::for_partition(&projection, &partition);
                prop_assert_ne!(&key, &CheckpointKey::for_projection(&projection));
                prop_assert_eq!(key.to_string(), format!("{projection}:{partition}"));
            }
        }
    }
}
