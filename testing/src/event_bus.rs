//! In-memory event source for engine tests.
//!
//! Every subscription gets its own unbounded channel, so each subscriber sees
//! every event published after it subscribed, in publish order. Events
//! published before anyone subscribed are not retained; tests should call
//! [`InMemoryEventBus::wait_for_subscribers`] before publishing.

#![allow(clippy::missing_panics_doc)]

use foldline_core::event::{Event, EventEnvelope, EventType};
use foldline_core::event_bus::{EventBusError, EventSource, EventStream};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};

type Subscriber = mpsc::UnboundedSender<Result<EventEnvelope, EventBusError>>;

/// In-process pub/sub implementing [`EventSource`].
///
/// # Example
///
/// ```
/// use foldline_core::event::EventType;
/// use foldline_core::event_bus::EventSource;
/// use foldline_testing::InMemoryEventBus;
/// use futures::StreamExt;
///
/// # async fn example() {
/// let bus = InMemoryEventBus::new();
/// let mut stream = bus.subscribe(EventType::of::<u32>()).await.unwrap();
///
/// bus.publish(7_u32);
/// let envelope = stream.next().await.unwrap().unwrap();
/// assert_eq!(envelope.downcast_ref::<u32>(), Some(&7));
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryEventBus {
    subscribers: Arc<Mutex<HashMap<EventType, Vec<Subscriber>>>>,
    subscriptions: Arc<watch::Sender<usize>>,
    fail_subscriptions: Arc<AtomicBool>,
}

impl InMemoryEventBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (subscriptions, _) = watch::channel(0);
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Arc::new(subscriptions),
            fail_subscriptions: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish an event to every current subscriber of its type.
    ///
    /// Returns the number of subscribers it was delivered to.
    pub fn publish<E: Event>(&self, event: E) -> usize {
        self.publish_envelope(EventEnvelope::new(event))
    }

    /// Publish an already wrapped event.
    pub fn publish_envelope(&self, envelope: EventEnvelope) -> usize {
        self.send(envelope.event_type(), || Ok(envelope.clone()))
    }

    /// Deliver a transport error to every subscriber of `event_type`.
    pub fn publish_error(&self, event_type: EventType, error: EventBusError) -> usize {
        self.send(event_type, || Err(error.clone()))
    }

    fn send(
        &self,
        event_type: EventType,
        item: impl Fn() -> Result<EventEnvelope, EventBusError>,
    ) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(senders) = subscribers.get_mut(&event_type) else {
            return 0;
        };
        senders.retain(|sender| !sender.is_closed());
        senders
            .iter()
            .filter(|sender| sender.send(item()).is_ok())
            .count()
    }

    /// Number of live subscriptions for an event type.
    #[must_use]
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_type)
            .map_or(0, |senders| senders.iter().filter(|sender| !sender.is_closed()).count())
    }

    /// Wait until `event_type` has at least `count` live subscriptions.
    pub async fn wait_for_subscribers(&self, event_type: EventType, count: usize) {
        let mut changes = self.subscriptions.subscribe();
        // The sender is owned by `self`, so the channel cannot close while we wait.
        let _ = changes
            .wait_for(|_| self.subscriber_count(event_type) >= count)
            .await;
    }

    /// End every subscription. Subscribers see their streams finish.
    pub fn close(&self) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Make subsequent subscriptions fail.
    pub fn fail_subscriptions(&self, fail: bool) {
        self.fail_subscriptions.store(fail, Ordering::SeqCst);
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for InMemoryEventBus {
    fn subscribe(
        &self,
        event_type: EventType,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        Box::pin(async move {
            if self.fail_subscriptions.load(Ordering::SeqCst) {
                return Err(EventBusError::SubscriptionFailed {
                    event_type: event_type.to_string(),
                    reason: "subscriptions disabled".to_string(),
                });
            }

            let (tx, mut rx) = mpsc::unbounded_channel();
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(event_type)
                .or_default()
                .push(tx);
            self.subscriptions.send_modify(|count| *count += 1);

            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(stream) as EventStream)
        })
    }
}
