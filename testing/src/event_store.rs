//! In-memory historical event store for replay tests.

#![allow(clippy::missing_panics_doc)]

use foldline_core::event::{Event, EventEnvelope, StoredEvent};
use foldline_core::event_store::{EventStore, EventStoreError, StoredEventStream};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

/// Volatile [`EventStore`] keeping each stream in a `Vec`.
///
/// Positions are indexes into the stream, starting at 0.
///
/// # Example
///
/// ```
/// use foldline_core::event::EventEnvelope;
/// use foldline_testing::InMemoryEventStore;
///
/// let store = InMemoryEventStore::new();
/// store.seed("balances", (0_u64..5).map(EventEnvelope::new));
/// assert_eq!(store.stream_len("balances"), 5);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    streams: Arc<RwLock<HashMap<String, Vec<EventEnvelope>>>>,
    fail_at: Arc<RwLock<Option<u64>>>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append events to a stream without going through the async API.
    pub fn seed(&self, stream: &str, events: impl IntoIterator<Item = EventEnvelope>) {
        self.streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(stream.to_string())
            .or_default()
            .extend(events);
    }

    /// Append one typed event to a stream, returning its position.
    pub fn push<E: Event>(&self, stream: &str, event: E) -> u64 {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        let events = streams.entry(stream.to_string()).or_default();
        events.push(EventEnvelope::new(event));
        events.len() as u64 - 1
    }

    /// Number of events in a stream.
    #[must_use]
    pub fn stream_len(&self, stream: &str) -> usize {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream)
            .map_or(0, Vec::len)
    }

    /// Make reads yield an error instead of the event at `position`.
    pub fn fail_reads_at(&self, position: Option<u64>) {
        *self.fail_at.write().unwrap_or_else(PoisonError::into_inner) = position;
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        stream: &str,
        event: EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<u64, EventStoreError>> + Send + '_>> {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        let events = streams.entry(stream.to_string()).or_default();
        events.push(event);
        let position = events.len() as u64 - 1;
        Box::pin(async move { Ok(position) })
    }

    fn read(
        &self,
        stream: &str,
        from_position: u64,
    ) -> Pin<Box<dyn Future<Output = Result<StoredEventStream, EventStoreError>> + Send + '_>> {
        let fail_at = *self.fail_at.read().unwrap_or_else(PoisonError::into_inner);
        let name = stream.to_string();
        let events: Vec<Result<StoredEvent, EventStoreError>> = self
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream)
            .map(|events| {
                events
                    .iter()
                    .enumerate()
                    .map(|(index, event)| (index as u64, event))
                    .skip_while(|(position, _)| *position < from_position)
                    .map(|(position, event)| {
                        if fail_at == Some(position) {
                            Err(EventStoreError::ReadFailed {
                                stream: name.clone(),
                                reason: format!("injected failure at position {position}"),
                            })
                        } else {
                            Ok(StoredEvent::new(position, event.clone()))
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Box::pin(async move { Ok(Box::pin(futures::stream::iter(events)) as StoredEventStream) })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn reads_from_an_inclusive_position() {
        let store = InMemoryEventStore::new();
        for n in 0_u32..4 {
            store.append("numbers", EventEnvelope::new(n)).await.unwrap();
        }

        let positions: Vec<u64> = store
            .read("numbers", 2)
            .await
            .unwrap()
            .map(|stored| stored.unwrap().position)
            .collect()
            .await;
        assert_eq!(positions, vec![2, 3]);
    }

    #[tokio::test]
    async fn unknown_streams_read_as_empty() {
        let store = InMemoryEventStore::new();
        let count = store.read("missing", 0).await.unwrap().count().await;
        assert_eq!(count, 0);
    }
}
