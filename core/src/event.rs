//! Event types carried through the projection engine.
//!
//! Events are opaque typed payloads. The engine never inspects them; it routes
//! them by their runtime type ([`EventType`]) and hands them to handlers that
//! were registered for that concrete type.
//!
//! # Design
//!
//! An [`EventEnvelope`] wraps an `Arc<dyn Any + Send + Sync>` together with its
//! [`EventType`]. Cloning an envelope is cheap, so the same event can be fanned
//! out to every handler of every projection without copying the payload.
//!
//! # Example
//!
//! ```
//! use foldline_core::event::{EventEnvelope, EventType};
//!
//! #[derive(Debug, PartialEq)]
//! struct OrderPlaced { order_id: u64 }
//!
//! let envelope = EventEnvelope::new(OrderPlaced { order_id: 7 });
//! assert_eq!(envelope.event_type(), EventType::of::<OrderPlaced>());
//! assert_eq!(envelope.downcast_ref::<OrderPlaced>(), Some(&OrderPlaced { order_id: 7 }));
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Marker trait for event payloads.
///
/// Any `Send + Sync + 'static` type can be published as an event; the blanket
/// implementation below means projection authors never implement this by hand.
pub trait Event: Any + Send + Sync + 'static {}

impl<T> Event for T where T: Any + Send + Sync + 'static {}

/// Runtime identity of an event type.
///
/// Equality and hashing use the [`TypeId`]; the type name is kept for logs.
#[derive(Clone, Copy)]
pub struct EventType {
    id: TypeId,
    name: &'static str,
}

impl EventType {
    /// The event type of `E`.
    #[must_use]
    pub fn of<E: Event>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: std::any::type_name::<E>(),
        }
    }

    /// The underlying [`TypeId`].
    #[must_use]
    pub const fn type_id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name, for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without its module path.
    #[must_use]
    pub fn short_name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }
}

impl PartialEq for EventType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventType {}

impl Hash for EventType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventType").field(&self.name).finish()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// A type-erased event tagged with its [`EventType`].
#[derive(Clone)]
pub struct EventEnvelope {
    event_type: EventType,
    payload: Arc<dyn Any + Send + Sync>,
}

impl EventEnvelope {
    /// Wrap an event.
    #[must_use]
    pub fn new<E: Event>(event: E) -> Self {
        Self::from_arc(Arc::new(event))
    }

    /// Wrap an already shared event.
    #[must_use]
    pub fn from_arc<E: Event>(event: Arc<E>) -> Self {
        Self {
            event_type: EventType::of::<E>(),
            payload: event,
        }
    }

    /// The runtime type of the wrapped event.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Returns `true` if the wrapped event is an `E`.
    #[must_use]
    pub fn is<E: Event>(&self) -> bool {
        self.event_type == EventType::of::<E>()
    }

    /// Borrow the event as `E`, if that is its type.
    #[must_use]
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.payload.downcast_ref::<E>()
    }

    /// Get a shared handle to the event as `E`, if that is its type.
    #[must_use]
    pub fn downcast<E: Event>(&self) -> Option<Arc<E>> {
        Arc::clone(&self.payload).downcast::<E>().ok()
    }
}

impl fmt::Debug for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEnvelope")
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

/// An event read back from a historical store, with its stream position.
///
/// Positions start at 0 and increase monotonically within a stream.
#[derive(Clone, Debug)]
pub struct StoredEvent {
    /// Position of the event within its stream
    pub position: u64,
    /// The event itself
    pub event: EventEnvelope,
}

impl StoredEvent {
    /// Create a stored event.
    #[must_use]
    pub const fn new(position: u64, event: EventEnvelope) -> Self {
        Self { position, event }
    }
}
