//! Bounded per-partition queue with backpressure.
//!
//! Each partition owns one queue with a single consumer (its worker). The queue
//! assigns positions at enqueue time, under its lock, so positions are strictly
//! increasing in queue order and a worker always observes them ascending.
//!
//! When the queue is full, the projection's [`BackpressureStrategy`] applies:
//!
//! - `Block`: [`PartitionQueue::push`] waits for a slot
//! - `DropNewest`: the incoming event is discarded
//! - `DropOldest`: the oldest queued event is evicted
//!
//! A closed queue (engine shutdown) still hands out queued events until it is
//! empty. A stopped queue (worker halted by its error policy) rejects new events
//! and discards the ones it held.

use crate::registry::RegisteredHandler;
use foldline_core::event::EventEnvelope;
use foldline_core::options::BackpressureStrategy;
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

/// An event waiting for its partition worker.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    /// Position assigned at enqueue time
    pub position: u64,
    /// The event
    pub envelope: EventEnvelope,
    /// The handler that will process it
    pub handler: Arc<RegisteredHandler>,
}

/// Result of [`PartitionQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The event was queued at `position`
    Enqueued {
        /// Assigned position
        position: u64,
        /// Queue depth after the push
        depth: usize,
    },
    /// The queue was full; the incoming event was discarded
    DroppedNewest,
    /// The queue was full; the oldest event was evicted to make room
    DroppedOldest {
        /// Position of the evicted event
        evicted: u64,
        /// Position assigned to the incoming event
        position: u64,
    },
    /// The queue's worker has stopped
    Stopped,
    /// The queue is closed for shutdown
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Open,
    Closed,
    Stopped,
}

#[derive(Debug)]
struct Inner {
    buffer: VecDeque<QueuedEvent>,
    next_position: u64,
    state: QueueState,
}

/// Bounded FIFO queue feeding one partition worker.
#[derive(Debug)]
pub struct PartitionQueue {
    inner: Mutex<Inner>,
    items: Notify,
    space: Notify,
    capacity: usize,
    strategy: BackpressureStrategy,
}

impl PartitionQueue {
    /// Create a queue whose first event gets `first_position`.
    #[must_use]
    pub fn new(capacity: usize, strategy: BackpressureStrategy, first_position: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer: VecDeque::with_capacity(capacity.min(1024)),
                next_position: first_position,
                state: QueueState::Open,
            }),
            items: Notify::new(),
            space: Notify::new(),
            capacity: capacity.max(1),
            strategy,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an event, applying the backpressure strategy when full.
    ///
    /// Only `Block` ever waits. Dropping the returned future while it waits
    /// leaves the queue unchanged.
    pub async fn push(&self, envelope: EventEnvelope, handler: Arc<RegisteredHandler>) -> PushOutcome {
        loop {
            let mut space = pin!(self.space.notified());
            space.as_mut().enable();

            {
                let mut inner = self.lock();
                match inner.state {
                    QueueState::Stopped => return PushOutcome::Stopped,
                    QueueState::Closed => return PushOutcome::Closed,
                    QueueState::Open => {}
                }

                if inner.buffer.len() < self.capacity {
                    let position = Self::enqueue(&mut inner, envelope, handler);
                    let depth = inner.buffer.len();
                    drop(inner);
                    self.items.notify_one();
                    return PushOutcome::Enqueued { position, depth };
                }

                match self.strategy {
                    BackpressureStrategy::Block => {}
                    BackpressureStrategy::DropNewest => return PushOutcome::DroppedNewest,
                    BackpressureStrategy::DropOldest => {
                        let evicted = inner.buffer.pop_front().map_or(0, |oldest| oldest.position);
                        let position = Self::enqueue(&mut inner, envelope, handler);
                        drop(inner);
                        self.items.notify_one();
                        return PushOutcome::DroppedOldest { evicted, position };
                    }
                }
            }

            space.await;
        }
    }

    fn enqueue(inner: &mut Inner, envelope: EventEnvelope, handler: Arc<RegisteredHandler>) -> u64 {
        let position = inner.next_position;
        inner.next_position += 1;
        inner.buffer.push_back(QueuedEvent {
            position,
            envelope,
            handler,
        });
        position
    }

    /// Take the next event, waiting if the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained, or stopped.
    pub async fn pop(&self) -> Option<QueuedEvent> {
        loop {
            let mut items = pin!(self.items.notified());
            items.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.state == QueueState::Stopped {
                    return None;
                }
                if let Some(item) = inner.buffer.pop_front() {
                    drop(inner);
                    self.space.notify_one();
                    return Some(item);
                }
                if inner.state == QueueState::Closed {
                    return None;
                }
            }

            items.await;
        }
    }

    /// Stop accepting events; queued events are still handed out.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            if inner.state == QueueState::Open {
                inner.state = QueueState::Closed;
            }
        }
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    /// Close the queue and discard queued events, returning how many were discarded.
    pub fn abandon(&self) -> usize {
        let discarded = {
            let mut inner = self.lock();
            if inner.state == QueueState::Open {
                inner.state = QueueState::Closed;
            }
            let discarded = inner.buffer.len();
            inner.buffer.clear();
            discarded
        };
        self.items.notify_waiters();
        self.space.notify_waiters();
        discarded
    }

    /// Mark the worker as stopped: reject new events and discard queued ones.
    ///
    /// Returns how many queued events were discarded.
    pub fn stop(&self) -> usize {
        let discarded = {
            let mut inner = self.lock();
            inner.state = QueueState::Stopped;
            let discarded = inner.buffer.len();
            inner.buffer.clear();
            discarded
        };
        self.items.notify_waiters();
        self.space.notify_waiters();
        discarded
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Returns `true` if no events are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position the next enqueued event will receive.
    #[must_use]
    pub fn next_position(&self) -> u64 {
        self.lock().next_position
    }

    /// Returns `true` once the worker has stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.lock().state == QueueState::Stopped
    }

    /// Configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
