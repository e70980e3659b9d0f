//! Checkpoint batching and the reference in-memory checkpoint store.

use foldline_core::checkpoint::{CheckpointKey, CheckpointStore};
use foldline_core::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

type PositionCell = Arc<Mutex<Option<u64>>>;

/// Volatile checkpoint store.
///
/// Checkpoints are lost when the process exits. Suitable for tests and for
/// projections that rebuild from scratch on every start.
///
/// # Example
///
/// ```
/// use foldline_core::checkpoint::{CheckpointKey, CheckpointStore};
/// use foldline_projections::InMemoryCheckpointStore;
///
/// # async fn example() -> foldline_core::Result<()> {
/// let store = InMemoryCheckpointStore::new();
/// let key = CheckpointKey::for_projection("balances");
///
/// store.save_checkpoint(&key, 41).await?;
/// assert_eq!(store.get_checkpoint(&key).await?, Some(41));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryCheckpointStore {
    positions: Arc<RwLock<HashMap<CheckpointKey, PositionCell>>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        let cells: Vec<_> = self
            .positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Arc::clone)
            .collect();
        cells
            .iter()
            .filter(|cell| cell.lock().unwrap_or_else(PoisonError::into_inner).is_some())
            .count()
    }

    /// Returns `true` if nothing has been checkpointed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn existing(&self, key: &CheckpointKey) -> Option<PositionCell> {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(Arc::clone)
    }

    // The outer write lock is only taken the first time a key is seen.
    fn cell(&self, key: &CheckpointKey) -> PositionCell {
        if let Some(cell) = self.existing(key) {
            return cell;
        }
        let mut positions = self.positions.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(positions.entry(key.clone()).or_default())
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn get_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u64>>> + Send + '_>> {
        let position = self
            .existing(key)
            .and_then(|cell| *cell.lock().unwrap_or_else(PoisonError::into_inner));
        Box::pin(async move { Ok(position) })
    }

    fn save_checkpoint(
        &self,
        key: &CheckpointKey,
        position: u64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let cell = self.cell(key);
        *cell.lock().unwrap_or_else(PoisonError::into_inner) = Some(position);
        Box::pin(async { Ok(()) })
    }

    fn reset_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        if let Some(cell) = self.existing(key) {
            *cell.lock().unwrap_or_else(PoisonError::into_inner) = None;
        }
        Box::pin(async { Ok(()) })
    }
}

/// Tracks processed positions for one checkpoint key and decides when to write.
///
/// The batcher never reports a position that was not recorded as processed,
/// so a checkpoint can never run ahead of processing.
#[derive(Debug, Clone)]
pub struct CheckpointBatcher {
    key: CheckpointKey,
    batch_size: u64,
    since_last_write: u64,
    last_processed: Option<u64>,
    committed: Option<u64>,
}

impl CheckpointBatcher {
    /// Create a batcher writing every `batch_size` events.
    #[must_use]
    pub fn new(key: CheckpointKey, batch_size: u64) -> Self {
        Self {
            key,
            batch_size: batch_size.max(1),
            since_last_write: 0,
            last_processed: None,
            committed: None,
        }
    }

    /// The checkpoint key.
    #[must_use]
    pub const fn key(&self) -> &CheckpointKey {
        &self.key
    }

    /// Record a processed position. Returns `true` when a batch is complete.
    pub fn record(&mut self, position: u64) -> bool {
        self.last_processed = Some(position);
        self.since_last_write += 1;
        self.since_last_write >= self.batch_size
    }

    /// Position to write, if anything was processed since the last write.
    #[must_use]
    pub fn pending(&self) -> Option<u64> {
        match (self.last_processed, self.committed) {
            (Some(last), Some(committed)) if last == committed => None,
            (last, _) => last,
        }
    }

    /// Note that `position` was written.
    pub fn mark_committed(&mut self, position: u64) {
        self.committed = Some(position);
        if self.last_processed == Some(position) {
            self.since_last_write = 0;
        }
    }

    /// Last written position.
    #[must_use]
    pub const fn committed(&self) -> Option<u64> {
        self.committed
    }

    /// Write the pending position to `store`.
    ///
    /// Returns the written position, or `None` if nothing was pending.
    ///
    /// # Errors
    ///
    /// Returns the store's error; the position stays pending.
    pub async fn flush(&mut self, store: &dyn CheckpointStore) -> Result<Option<u64>> {
        let Some(position) = self.pending() else {
            return Ok(None);
        };
        store.save_checkpoint(&self.key, position).await?;
        self.mark_committed(position);
        Ok(Some(position))
    }
}
