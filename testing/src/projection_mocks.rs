//! Configurable mock projection handlers.
//!
//! [`MockProjection`] records every invocation and can be told to fail, to
//! wait on a [`Gate`], or to take time, so tests can drive the engine into
//! retries, backpressure and concurrency limits deterministically.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use chrono::{DateTime, Utc};
use foldline_core::error::{ProjectionError, Result};
use foldline_core::event::Event;
use foldline_core::projection::{
    DEFAULT_PARTITION, PartitionedHandler, ProcessingMode, ProjectionContext, ProjectionHandler,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

type KeyFn<E> = dyn Fn(&E) -> Result<String> + Send + Sync;
type FailFn<E> = dyn Fn(&E, &ProjectionContext) -> bool + Send + Sync;

/// One call to [`MockProjection::project`].
#[derive(Debug, Clone)]
pub struct Invocation<E> {
    /// The event
    pub event: E,
    /// Event position
    pub position: u64,
    /// Partition key from the context
    pub partition: String,
    /// Attempt number
    pub attempt: u32,
    /// Live or replay
    pub mode: ProcessingMode,
    /// Whether the call succeeded
    pub succeeded: bool,
    /// When the call started
    pub at: DateTime<Utc>,
}

/// Holds handler calls until the test releases them.
///
/// # Example
///
/// ```
/// use foldline_testing::Gate;
///
/// let gate = Gate::closed();
/// gate.release(2); // let two calls through
/// gate.open();     // let everything through
/// ```
#[derive(Clone, Debug)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    /// A gate that holds every call.
    #[must_use]
    pub fn closed() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    /// Let `count` more calls through.
    pub fn release(&self, count: usize) {
        self.permits.add_permits(count);
    }

    /// Let every call through from now on.
    pub fn open(&self) {
        self.permits.add_permits(1 << 20);
    }

    pub(crate) async fn pass(&self) {
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

/// A handler for events of type `E` with scripted behaviour.
///
/// # Example
///
/// ```ignore
/// let handler = Arc::new(
///     MockProjection::<Deposited>::new()
///         .partitioned_by(|event| Ok(event.account.clone()))
///         .failing_first(2),
/// );
/// registry.register_partitioned::<Deposited, _>("balances", handler.clone(), options)?;
///
/// // ... run the engine ...
/// assert_eq!(handler.succeeded().len(), 3);
/// ```
pub struct MockProjection<E> {
    key: Option<Box<KeyFn<E>>>,
    fail_first: u32,
    fail_when: Option<Box<FailFn<E>>>,
    gate: Option<Gate>,
    delay: Option<Duration>,
    invocations: Mutex<Vec<Invocation<E>>>,
    entered: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl<E: Event + Clone> MockProjection<E> {
    /// A handler that accepts every event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            key: None,
            fail_first: 0,
            fail_when: None,
            gate: None,
            delay: None,
            invocations: Mutex::new(Vec::new()),
            entered: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Compute partition keys with `key`.
    #[must_use]
    pub fn partitioned_by(mut self, key: impl Fn(&E) -> Result<String> + Send + Sync + 'static) -> Self {
        self.key = Some(Box::new(key));
        self
    }

    /// Fail the first `attempts` attempts at every event.
    #[must_use]
    pub const fn failing_first(mut self, attempts: u32) -> Self {
        self.fail_first = attempts;
        self
    }

    /// Fail every attempt for which `predicate` holds.
    #[must_use]
    pub fn failing_when(
        mut self,
        predicate: impl Fn(&E, &ProjectionContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    /// Wait on `gate` before handling each attempt.
    #[must_use]
    pub fn gated(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Take `delay` to handle each attempt.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every invocation, in call order.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation<E>> {
        self.invocations.lock().unwrap().clone()
    }

    /// Successful invocations, in call order.
    #[must_use]
    pub fn succeeded(&self) -> Vec<Invocation<E>> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|invocation| invocation.succeeded)
            .cloned()
            .collect()
    }

    /// Successful events, in call order.
    #[must_use]
    pub fn succeeded_events(&self) -> Vec<E> {
        self.succeeded().into_iter().map(|invocation| invocation.event).collect()
    }

    /// Number of completed attempts, successful or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    /// Number of calls that have started, including those waiting on the gate.
    #[must_use]
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Highest number of calls past the gate at the same time.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn should_fail(&self, event: &E, ctx: &ProjectionContext) -> bool {
        ctx.attempt() <= self.fail_first
            || self.fail_when.as_ref().is_some_and(|predicate| predicate(event, ctx))
    }
}

impl<E: Event + Clone> Default for MockProjection<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event + Clone> ProjectionHandler<E> for MockProjection<E> {
    async fn project(&self, event: &E, ctx: &ProjectionContext) -> Result<()> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.pass().await;
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let at = Utc::now();

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }

        let failed = self.should_fail(event, ctx);
        self.invocations.lock().unwrap().push(Invocation {
            event: event.clone(),
            position: ctx.position(),
            partition: ctx.partition_key().to_string(),
            attempt: ctx.attempt(),
            mode: ctx.mode(),
            succeeded: !failed,
            at,
        });
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if failed {
            Err(ProjectionError::processing(format!(
                "scripted failure at position {} attempt {}",
                ctx.position(),
                ctx.attempt()
            )))
        } else {
            Ok(())
        }
    }
}

impl<E: Event + Clone> PartitionedHandler<E> for MockProjection<E> {
    fn partition_key(&self, event: &E) -> Result<String> {
        self.key
            .as_ref()
            .map_or_else(|| Ok(DEFAULT_PARTITION.to_string()), |key| key(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foldline_core::shutdown::ShutdownSignal;

    fn ctx(position: u64, attempt: u32) -> ProjectionContext {
        ProjectionContext::new(
            Arc::from("mock"),
            Arc::from(DEFAULT_PARTITION),
            position,
            ProcessingMode::Live,
            ShutdownSignal::never(),
        )
        .with_attempt(attempt)
    }

    #[tokio::test]
    async fn failing_first_fails_early_attempts_only() {
        let handler = MockProjection::<u32>::new().failing_first(1);

        assert!(handler.project(&5, &ctx(0, 1)).await.is_err());
        assert!(handler.project(&5, &ctx(0, 2)).await.is_ok());
        assert_eq!(handler.attempts(), 2);
        assert_eq!(handler.succeeded_events(), vec![5]);
    }

    #[tokio::test]
    async fn gate_holds_calls_until_released() {
        let gate = Gate::closed();
        let handler = Arc::new(MockProjection::<u32>::new().gated(gate.clone()));

        let call = tokio::spawn({
            let handler = Arc::clone(&handler);
            async move { handler.project(&1, &ctx(0, 1)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.entered(), 1);
        assert_eq!(handler.attempts(), 0);

        gate.release(1);
        assert!(call.await.unwrap().is_ok());
        assert_eq!(handler.attempts(), 1);
    }

    #[test]
    fn key_function_defaults_to_the_default_partition() {
        let plain = MockProjection::<u32>::new();
        assert_eq!(plain.partition_key(&3).unwrap(), DEFAULT_PARTITION);

        let keyed = MockProjection::<u32>::new().partitioned_by(|n| Ok(format!("k{}", n % 2)));
        assert_eq!(keyed.partition_key(&3).unwrap(), "k1");
    }
}
