//! Per-projection configuration and replay options.
//!
//! Options are settable programmatically (the `with_*` builders) or from
//! declarative metadata ([`ProjectionOptions::from_json`]). Either way they are
//! validated before a projection is registered, so invalid configuration fails
//! fast and never surfaces at runtime.
//!
//! # Defaults
//!
//! | Option                      | Default  |
//! |-----------------------------|----------|
//! | `max_degree_of_parallelism` | 1        |
//! | `checkpoint_batch_size`     | 100      |
//! | `channel_capacity`          | 1000     |
//! | `backpressure`              | `Block`  |
//! | `startup_mode`              | `Resume` |
//! | `error_handling.strategy`   | `Retry`  |
//! | `max_retry_attempts`        | 3        |
//! | `initial_retry_delay`       | 1000ms   |
//! | `max_retry_delay`           | 30000ms  |
//! | `fallback_strategy`         | `Skip`   |
//!
//! # Example
//!
//! ```
//! use foldline_core::options::{BackpressureStrategy, ProjectionOptions};
//!
//! let options = ProjectionOptions::from_json(
//!     r#"{ "max_degree_of_parallelism": 4, "backpressure": "drop_oldest" }"#,
//! )?;
//! assert_eq!(options.max_degree_of_parallelism, 4);
//! assert_eq!(options.backpressure, BackpressureStrategy::DropOldest);
//! assert_eq!(options.checkpoint_batch_size, 100);
//! # Ok::<(), foldline_core::ProjectionError>(())
//! ```

use crate::error::{ProjectionError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do when a partition's bounded queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureStrategy {
    /// Suspend ingestion until a slot frees. No data loss.
    #[default]
    Block,
    /// Discard the incoming event.
    DropNewest,
    /// Evict the oldest queued event to make room.
    DropOldest,
}

/// Where a projection starts consuming when the engine starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    /// Continue from the stored checkpoint.
    #[default]
    Resume,
    /// Ignore any checkpoint and start at position 0.
    Replay,
    /// Start from the beginning of the stream, then follow live events.
    CatchUp,
    /// Only process events that arrive after subscription.
    LiveOnly,
}

/// Primary strategy applied when a handler fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Retry with exponential backoff, then apply the fallback.
    #[default]
    Retry,
    /// Log and advance past the event.
    Skip,
    /// Halt the partition's worker.
    Stop,
}

/// Strategy applied once retries are exhausted.
///
/// There is deliberately no `Retry` variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Log and advance past the event.
    #[default]
    Skip,
    /// Halt the partition's worker.
    Stop,
}

/// Retry/skip/stop configuration for a projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlingOptions {
    /// Strategy applied on handler failure
    pub strategy: ErrorStrategy,
    /// Total attempts per event, including the first (must be > 0)
    pub max_retry_attempts: u32,
    /// Delay before the first retry
    #[serde(rename = "initial_retry_delay_ms", with = "duration_ms")]
    pub initial_retry_delay: Duration,
    /// Upper bound for the backoff delay
    #[serde(rename = "max_retry_delay_ms", with = "duration_ms")]
    pub max_retry_delay: Duration,
    /// Strategy applied once retries are exhausted
    pub fallback_strategy: FallbackStrategy,
}

impl Default for ErrorHandlingOptions {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::Retry,
            max_retry_attempts: 3,
            initial_retry_delay: Duration::from_millis(1000),
            max_retry_delay: Duration::from_millis(30_000),
            fallback_strategy: FallbackStrategy::Skip,
        }
    }
}

impl ErrorHandlingOptions {
    /// Skip failed events without retrying.
    #[must_use]
    pub fn skip() -> Self {
        Self {
            strategy: ErrorStrategy::Skip,
            ..Self::default()
        }
    }

    /// Stop the partition on the first failure.
    #[must_use]
    pub fn stop() -> Self {
        Self {
            strategy: ErrorStrategy::Stop,
            ..Self::default()
        }
    }

    /// Retry up to `max_attempts` times, then apply `fallback`.
    #[must_use]
    pub fn retry(max_attempts: u32, fallback: FallbackStrategy) -> Self {
        Self {
            strategy: ErrorStrategy::Retry,
            max_retry_attempts: max_attempts,
            fallback_strategy: fallback,
            ..Self::default()
        }
    }

    /// Set the backoff delays.
    #[must_use]
    pub const fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_retry_delay = initial;
        self.max_retry_delay = max;
        self
    }

    /// Validate the error handling configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Configuration`] if any invariant is violated.
    pub fn validate(&self) -> Result<()> {
        if self.max_retry_attempts == 0 {
            return Err(config_error("max_retry_attempts must be > 0"));
        }
        if self.initial_retry_delay.is_zero() {
            return Err(config_error("initial_retry_delay must be > 0"));
        }
        if self.max_retry_delay.is_zero() {
            return Err(config_error("max_retry_delay must be > 0"));
        }
        if self.initial_retry_delay > self.max_retry_delay {
            return Err(config_error(
                "initial_retry_delay must be <= max_retry_delay",
            ));
        }
        Ok(())
    }
}

/// Configuration for one projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionOptions {
    /// Maximum concurrent handler invocations across all partitions (>= 1)
    pub max_degree_of_parallelism: usize,
    /// Events processed per partition between checkpoint writes (>= 1)
    pub checkpoint_batch_size: u64,
    /// Capacity of each partition's queue (>= 1)
    pub channel_capacity: usize,
    /// Behaviour when a partition queue is full
    pub backpressure: BackpressureStrategy,
    /// Where consumption starts
    pub startup_mode: StartupMode,
    /// Failure handling
    pub error_handling: ErrorHandlingOptions,
}

impl Default for ProjectionOptions {
    fn default() -> Self {
        Self {
            max_degree_of_parallelism: 1,
            checkpoint_batch_size: 100,
            channel_capacity: 1000,
            backpressure: BackpressureStrategy::Block,
            startup_mode: StartupMode::Resume,
            error_handling: ErrorHandlingOptions::default(),
        }
    }
}

impl ProjectionOptions {
    /// Parse options from JSON metadata and validate them.
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Configuration`] if the JSON does not parse
    /// (including a `retry` fallback strategy) or the options are invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| config_error(format!("invalid projection options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Set the maximum degree of parallelism.
    #[must_use]
    pub const fn with_max_degree_of_parallelism(mut self, max: usize) -> Self {
        self.max_degree_of_parallelism = max;
        self
    }

    /// Set the checkpoint batch size.
    #[must_use]
    pub const fn with_checkpoint_batch_size(mut self, size: u64) -> Self {
        self.checkpoint_batch_size = size;
        self
    }

    /// Set the per-partition queue capacity.
    #[must_use]
    pub const fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the backpressure strategy.
    #[must_use]
    pub const fn with_backpressure(mut self, strategy: BackpressureStrategy) -> Self {
        self.backpressure = strategy;
        self
    }

    /// Set the startup mode.
    #[must_use]
    pub const fn with_startup_mode(mut self, mode: StartupMode) -> Self {
        self.startup_mode = mode;
        self
    }

    /// Set the error handling options.
    #[must_use]
    pub fn with_error_handling(mut self, error_handling: ErrorHandlingOptions) -> Self {
        self.error_handling = error_handling;
        self
    }

    /// Validate the projection configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Configuration`] if any invariant is violated.
    pub fn validate(&self) -> Result<()> {
        if self.max_degree_of_parallelism == 0 {
            return Err(config_error("max_degree_of_parallelism must be >= 1"));
        }
        if self.checkpoint_batch_size == 0 {
            return Err(config_error("checkpoint_batch_size must be >= 1"));
        }
        if self.channel_capacity == 0 {
            return Err(config_error("channel_capacity must be >= 1"));
        }
        self.error_handling.validate()
    }
}

/// When replay persists checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// Write every batch, plus the trailing partial batch.
    #[default]
    Normal,
    /// Write once, after the last event.
    FinalOnly,
    /// Never write.
    None,
}

/// Options for one replay call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayOptions {
    /// First position to replay (inclusive). Takes precedence over `from_checkpoint`.
    pub from_position: Option<u64>,
    /// Last position to replay (inclusive).
    pub to_position: Option<u64>,
    /// Resume after the stored checkpoint.
    pub from_checkpoint: bool,
    /// Events between checkpoint writes; defaults to the projection's batch size.
    pub batch_size: Option<u64>,
    /// Only replay events routed to this partition.
    pub partition: Option<String>,
    /// Invoke handlers but never write checkpoints.
    pub dry_run: bool,
    /// When checkpoints are written.
    pub checkpoint_mode: CheckpointMode,
}

impl ReplayOptions {
    /// Replay everything from position 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start at `position`.
    #[must_use]
    pub const fn from_position(mut self, position: u64) -> Self {
        self.from_position = Some(position);
        self
    }

    /// Stop after `position`.
    #[must_use]
    pub const fn to_position(mut self, position: u64) -> Self {
        self.to_position = Some(position);
        self
    }

    /// Resume after the stored checkpoint.
    #[must_use]
    pub const fn from_checkpoint(mut self) -> Self {
        self.from_checkpoint = true;
        self
    }

    /// Write a checkpoint every `size` events.
    #[must_use]
    pub const fn with_batch_size(mut self, size: u64) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Restrict the replay to one partition.
    #[must_use]
    pub fn for_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    /// Invoke handlers without writing checkpoints.
    #[must_use]
    pub const fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Set the checkpoint mode.
    #[must_use]
    pub const fn with_checkpoint_mode(mut self, mode: CheckpointMode) -> Self {
        self.checkpoint_mode = mode;
        self
    }

    /// Returns `true` if this replay may write checkpoints at all.
    #[must_use]
    pub const fn writes_checkpoints(&self) -> bool {
        !self.dry_run && !matches!(self.checkpoint_mode, CheckpointMode::None)
    }

    /// Validate the replay options.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Configuration`] if the position bounds are
    /// inverted or the batch size is zero.
    pub fn validate(&self) -> Result<()> {
        if let (Some(from), Some(to)) = (self.from_position, self.to_position) {
            if from > to {
                return Err(config_error(format!(
                    "from_position ({from}) must be <= to_position ({to})"
                )));
            }
        }
        if self.batch_size == Some(0) {
            return Err(config_error("batch_size must be > 0"));
        }
        if matches!(&self.partition, Some(p) if p.is_empty()) {
            return Err(config_error("partition must not be empty"));
        }
        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> ProjectionError {
    ProjectionError::Configuration(message.into())
}

/// Serde adapter storing a `Duration` as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
