//! Checkpoint store that records every call, for asserting write patterns.

#![allow(clippy::missing_panics_doc)]

use foldline_core::checkpoint::{CheckpointKey, CheckpointStore};
use crate::projection_mocks::Gate;
use foldline_core::error::{ProjectionError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default)]
struct Recorded {
    positions: HashMap<CheckpointKey, u64>,
    saves: Vec<(CheckpointKey, u64)>,
    resets: Vec<CheckpointKey>,
}

/// In-memory [`CheckpointStore`] that keeps a log of saves and resets.
///
/// # Example
///
/// ```
/// use foldline_core::checkpoint::{CheckpointKey, CheckpointStore};
/// use foldline_testing::RecordingCheckpointStore;
///
/// # async fn example() -> foldline_core::Result<()> {
/// let store = RecordingCheckpointStore::new();
/// let key = CheckpointKey::for_projection("balances");
///
/// store.save_checkpoint(&key, 1).await?;
/// store.save_checkpoint(&key, 3).await?;
/// assert_eq!(store.saves_for(&key), vec![1, 3]);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct RecordingCheckpointStore {
    recorded: Arc<Mutex<Recorded>>,
    fail_saves: Arc<AtomicBool>,
    fail_loads: Arc<AtomicBool>,
    held_loads: Arc<Mutex<HashMap<CheckpointKey, Gate>>>,
}

impl RecordingCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a checkpoint without recording a save.
    pub fn set(&self, key: &CheckpointKey, position: u64) {
        self.lock().positions.insert(key.clone(), position);
    }

    /// Current checkpoint for a key.
    #[must_use]
    pub fn get(&self, key: &CheckpointKey) -> Option<u64> {
        self.lock().positions.get(key).copied()
    }

    /// Every save, in call order.
    #[must_use]
    pub fn saves(&self) -> Vec<(CheckpointKey, u64)> {
        self.lock().saves.clone()
    }

    /// Saved positions for one key, in call order.
    #[must_use]
    pub fn saves_for(&self, key: &CheckpointKey) -> Vec<u64> {
        self.lock()
            .saves
            .iter()
            .filter(|(saved, _)| saved == key)
            .map(|(_, position)| *position)
            .collect()
    }

    /// Every reset, in call order.
    #[must_use]
    pub fn resets(&self) -> Vec<CheckpointKey> {
        self.lock().resets.clone()
    }

    /// Make saves fail with [`ProjectionError::Checkpoint`].
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make loads fail with [`ProjectionError::Checkpoint`].
    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make loads of `key` wait on `gate`.
    pub fn hold_loads(&self, key: &CheckpointKey, gate: Gate) {
        self.held_loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), gate);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CheckpointStore for RecordingCheckpointStore {
    fn get_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u64>>> + Send + '_>> {
        let gate = self
            .held_loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        let key = key.clone();
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.pass().await;
            }
            if self.fail_loads.load(Ordering::SeqCst) {
                Err(ProjectionError::Checkpoint(format!("load failed for '{key}'")))
            } else {
                Ok(self.get(&key))
            }
        })
    }

    fn save_checkpoint(
        &self,
        key: &CheckpointKey,
        position: u64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let result = if self.fail_saves.load(Ordering::SeqCst) {
            Err(ProjectionError::Checkpoint(format!("save failed for '{key}'")))
        } else {
            let mut recorded = self.lock();
            recorded.positions.insert(key.clone(), position);
            recorded.saves.push((key.clone(), position));
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn reset_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let mut recorded = self.lock();
        recorded.positions.remove(key);
        recorded.resets.push(key.clone());
        drop(recorded);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn failing_saves_leave_no_record() {
        let store = RecordingCheckpointStore::new();
        let key = CheckpointKey::for_projection("balances");
        store.fail_saves(true);

        assert!(store.save_checkpoint(&key, 4).await.is_err());
        assert!(store.saves().is_empty());
        assert_eq!(store.get(&key), None);
    }

    #[tokio::test]
    async fn held_loads_wait_for_the_gate() {
        let store = RecordingCheckpointStore::new();
        let held = CheckpointKey::for_partition("balances", "acct-1");
        let free = CheckpointKey::for_partition("balances", "acct-2");
        let gate = Gate::closed();
        store.set(&held, 3);
        store.hold_loads(&held, gate.clone());

        assert_eq!(store.get_checkpoint(&free).await.unwrap(), None);
        let waiting = tokio::time::timeout(std::time::Duration::from_millis(20), store.get_checkpoint(&held)).await;
        assert!(waiting.is_err());

        gate.release(1);
        assert_eq!(store.get_checkpoint(&held).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn resets_are_recorded() {
        let store = RecordingCheckpointStore::new();
        let key = CheckpointKey::for_partition("balances", "acct-1");
        store.set(&key, 7);

        store.reset_checkpoint(&key).await.unwrap();
        assert_eq!(store.resets(), vec![key.clone()]);
        assert_eq!(store.get_checkpoint(&key).await.unwrap(), None);
    }
}
