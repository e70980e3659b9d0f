//! Handler registry: which handlers consume which event types.
//!
//! The registry is built once, at startup, and then shared read-only (behind an
//! `Arc`) with the [`ProjectionEngine`](crate::ProjectionEngine) and the
//! [`ReplayService`](crate::ReplayService). Each registration precomputes a
//! type-erased invoke closure (and, for partitioned handlers, a key closure)
//! bound to the concrete event type, so dispatch never inspects types beyond a
//! single downcast.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = HandlerRegistry::new();
//! let balances = Arc::new(AccountBalances::new(store));
//!
//! registry.register_partitioned::<AccountCredited, _>("balances", balances.clone(), options.clone())?;
//! registry.register_partitioned::<AccountDebited, _>("balances", balances, options)?;
//!
//! let registry = Arc::new(registry);
//! ```

use foldline_core::error::{ProjectionError, Result};
use foldline_core::event::{Event, EventEnvelope, EventType};
use foldline_core::options::ProjectionOptions;
use foldline_core::projection::{PartitionedHandler, ProjectionContext, ProjectionHandler};
use futures::FutureExt;
use futures::future::BoxFuture;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

type ProjectFn = dyn Fn(EventEnvelope, ProjectionContext) -> BoxFuture<'static, Result<()>> + Send + Sync;
type PartitionFn = dyn Fn(&EventEnvelope) -> Result<String> + Send + Sync;

/// Handlers of one event type; most event types feed only a few projections.
type HandlerList = SmallVec<[Arc<RegisteredHandler>; 4]>;

/// Describes one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionRegistration {
    /// Projection the handler belongs to
    pub projection_name: String,
    /// Event type the handler consumes
    pub event_type: EventType,
    /// Concrete handler type name
    pub handler_type: &'static str,
    /// Whether the handler supplies partition keys
    pub partitioned: bool,
}

/// A registered handler, with its type-erased closures.
pub struct RegisteredHandler {
    id: u64,
    registration: ProjectionRegistration,
    invoke: Arc<ProjectFn>,
    partition: Option<Arc<PartitionFn>>,
}

impl RegisteredHandler {
    /// Unique id within the registry.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The registration record.
    #[must_use]
    pub const fn registration(&self) -> &ProjectionRegistration {
        &self.registration
    }

    /// Projection the handler belongs to.
    #[must_use]
    pub fn projection_name(&self) -> &str {
        &self.registration.projection_name
    }

    /// Event type the handler consumes.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.registration.event_type
    }

    /// Whether the handler supplies partition keys.
    #[must_use]
    pub const fn is_partitioned(&self) -> bool {
        self.partition.is_some()
    }

    /// Invoke the handler for an event.
    ///
    /// The returned future owns everything it needs.
    ///
    /// # Errors
    ///
    /// Returns the handler's error, or [`ProjectionError::EventProcessing`] if
    /// the envelope does not carry this handler's event type.
    pub fn invoke(&self, envelope: EventEnvelope, ctx: ProjectionContext) -> BoxFuture<'static, Result<()>> {
        (self.invoke)(envelope, ctx)
    }

    /// Run the handler's key function, if it has one.
    pub(crate) fn key_fn(&self) -> Option<&PartitionFn> {
        self.partition.as_deref()
    }
}

impl fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("id", &self.id)
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}

/// Mapping from event type to registered handlers, plus per-projection options.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, HandlerList>,
    projections: BTreeMap<String, ProjectionOptions>,
    next_id: u64,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler that runs in the default partition.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Registration`] if the name is empty or the
    ///   projection already has a handler for `E`
    /// - [`ProjectionError::Configuration`] if the options are invalid, or
    ///   differ from the options the projection was first registered with
    pub fn register<E, H>(
        &mut self,
        projection_name: &str,
        handler: Arc<H>,
        options: ProjectionOptions,
    ) -> Result<()>
    where
        E: Event,
        H: ProjectionHandler<E>,
    {
        let invoke = invoke_fn::<E, H>(handler);
        self.insert::<E, H>(projection_name, options, invoke, None)
    }

    /// Register a handler that supplies a partition key per event.
    ///
    /// # Errors
    ///
    /// Same as [`HandlerRegistry::register`].
    pub fn register_partitioned<E, H>(
        &mut self,
        projection_name: &str,
        handler: Arc<H>,
        options: ProjectionOptions,
    ) -> Result<()>
    where
        E: Event,
        H: PartitionedHandler<E>,
    {
        let key_handler = Arc::clone(&handler);
        let partition: Arc<PartitionFn> = Arc::new(move |envelope: &EventEnvelope| {
            let event = envelope
                .downcast_ref::<E>()
                .ok_or_else(|| type_mismatch::<E>(envelope))?;
            key_handler.partition_key(event)
        });
        let invoke = invoke_fn::<E, H>(handler);
        self.insert::<E, H>(projection_name, options, invoke, Some(partition))
    }

    fn insert<E: Event, H>(
        &mut self,
        projection_name: &str,
        options: ProjectionOptions,
        invoke: Arc<ProjectFn>,
        partition: Option<Arc<PartitionFn>>,
    ) -> Result<()> {
        if projection_name.trim().is_empty() {
            return Err(ProjectionError::Registration(
                "projection name must not be empty".to_string(),
            ));
        }

        let event_type = EventType::of::<E>();
        match self.projections.get(projection_name) {
            Some(existing) if *existing != options => {
                return Err(ProjectionError::Configuration(format!(
                    "projection '{projection_name}' was already registered with different options"
                )));
            }
            Some(_) => {
                if self.get_registration(projection_name, event_type).is_some() {
                    return Err(ProjectionError::Registration(format!(
                        "projection '{projection_name}' already has a handler for {event_type}"
                    )));
                }
            }
            None => options.validate()?,
        }

        self.next_id += 1;
        let handler = RegisteredHandler {
            id: self.next_id,
            registration: ProjectionRegistration {
                projection_name: projection_name.to_string(),
                event_type,
                handler_type: std::any::type_name::<H>(),
                partitioned: partition.is_some(),
            },
            invoke,
            partition,
        };

        self.projections
            .entry(projection_name.to_string())
            .or_insert(options);
        self.handlers
            .entry(event_type)
            .or_default()
            .push(Arc::new(handler));
        Ok(())
    }

    /// Handlers registered for an event type, across all projections.
    #[must_use]
    pub fn get_handlers(&self, event_type: EventType) -> &[Arc<RegisteredHandler>] {
        self.handlers
            .get(&event_type)
            .map(SmallVec::as_slice)
            .unwrap_or_default()
    }

    /// Every event type with at least one handler.
    #[must_use]
    pub fn event_types(&self) -> Vec<EventType> {
        self.handlers.keys().copied().collect()
    }

    /// The registration of a projection's handler for an event type.
    #[must_use]
    pub fn get_registration(
        &self,
        projection_name: &str,
        event_type: EventType,
    ) -> Option<&ProjectionRegistration> {
        self.get_handlers(event_type)
            .iter()
            .map(|handler| handler.registration())
            .find(|registration| registration.projection_name == projection_name)
    }

    /// Registered projection names, in sorted order.
    #[must_use]
    pub fn projection_names(&self) -> Vec<&str> {
        self.projections.keys().map(String::as_str).collect()
    }

    /// Returns `true` if the projection has at least one handler.
    #[must_use]
    pub fn contains_projection(&self, projection_name: &str) -> bool {
        self.projections.contains_key(projection_name)
    }

    /// Options of a registered projection.
    #[must_use]
    pub fn projection_options(&self, projection_name: &str) -> Option<&ProjectionOptions> {
        self.projections.get(projection_name)
    }

    /// All handlers of one projection.
    #[must_use]
    pub fn handlers_for_projection(&self, projection_name: &str) -> Vec<Arc<RegisteredHandler>> {
        let mut handlers: Vec<_> = self
            .handlers
            .values()
            .flatten()
            .filter(|handler| handler.projection_name() == projection_name)
            .cloned()
            .collect();
        handlers.sort_by_key(|handler| handler.id());
        handlers
    }

    /// Event types consumed by one projection.
    #[must_use]
    pub fn event_types_for_projection(&self, projection_name: &str) -> Vec<EventType> {
        self.handlers_for_projection(projection_name)
            .iter()
            .map(|handler| handler.event_type())
            .collect()
    }

    /// Remove every registration.
    pub fn clear(&mut self) {
        self.handlers.clear();
        self.projections.clear();
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.values().map(SmallVec::len).sum()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn invoke_fn<E, H>(handler: Arc<H>) -> Arc<ProjectFn>
where
    E: Event,
    H: ProjectionHandler<E>,
{
    Arc::new(move |envelope: EventEnvelope, ctx: ProjectionContext| {
        let handler = Arc::clone(&handler);
        async move {
            let event = envelope
                .downcast::<E>()
                .ok_or_else(|| type_mismatch::<E>(&envelope))?;
            handler.project(&event, &ctx).await
        }
        .boxed()
    })
}

fn type_mismatch<E: Event>(envelope: &EventEnvelope) -> ProjectionError {
    ProjectionError::EventProcessing(format!(
        "expected {} but received {}",
        EventType::of::<E>(),
        envelope.event_type()
    ))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use foldline_core::shutdown::ShutdownSignal;
    use foldline_core::projection::ProcessingMode;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Deposited(u64);
    struct Withdrawn(u64);

    #[derive(Default)]
    struct Ledger {
        total: AtomicU64,
    }

    impl ProjectionHandler<Deposited> for Ledger {
        async fn project(&self, event: &Deposited, _ctx: &ProjectionContext) -> Result<()> {
            self.total.fetch_add(event.0, Ordering::SeqCst);
            Ok(())
        }
    }

    impl ProjectionHandler<Withdrawn> for Ledger {
        async fn project(&self, event: &Withdrawn, _ctx: &ProjectionContext) -> Result<()> {
            self.total.fetch_sub(event.0, Ordering::SeqCst);
            Ok(())
        }
    }

    impl PartitionedHandler<Withdrawn> for Ledger {
        fn partition_key(&self, event: &Withdrawn) -> Result<String> {
            Ok(format!("w-{}", event.0))
        }
    }

    fn ctx() -> ProjectionContext {
        ProjectionContext::new(
            Arc::from("ledger"),
            Arc::from("_default"),
            0,
            ProcessingMode::Live,
            ShutdownSignal::never(),
        )
    }

    #[tokio::test]
    async fn multi_event_projection_shares_one_handler() {
        let ledger = Arc::new(Ledger::default());
        let mut registry = HandlerRegistry::new();
        registry
            .register::<Deposited, _>("ledger", ledger.clone(), ProjectionOptions::default())
            .unwrap();
        registry
            .register_partitioned::<Withdrawn, _>("ledger", ledger.clone(), ProjectionOptions::default())
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.projection_names(), vec!["ledger"]);
        assert_eq!(registry.event_types_for_projection("ledger").len(), 2);

        let deposit = &registry.get_handlers(EventType::of::<Deposited>())[0];
        assert!(!deposit.is_partitioned());
        deposit.invoke(EventEnvelope::new(Deposited(10)), ctx()).await.unwrap();

        let withdraw = &registry.get_handlers(EventType::of::<Withdrawn>())[0];
        assert!(withdraw.is_partitioned());
        withdraw.invoke(EventEnvelope::new(Withdrawn(4)), ctx()).await.unwrap();

        assert_eq!(ledger.total.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn mismatched_envelope_is_a_processing_error() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<Deposited, _>("ledger", Arc::new(Ledger::default()), ProjectionOptions::default())
            .unwrap();

        let handler = &registry.get_handlers(EventType::of::<Deposited>())[0];
        let result = handler.invoke(EventEnvelope::new(Withdrawn(1)), ctx()).await;
        assert!(matches!(result, Err(ProjectionError::EventProcessing(_))));
    }

    #[test]
    fn registration_record_names_the_handler_type() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<Deposited, _>("ledger", Arc::new(Ledger::default()), ProjectionOptions::default())
            .unwrap();

        let registration = registry
            .get_registration("ledger", EventType::of::<Deposited>())
            .unwrap();
        assert!(registration.handler_type.ends_with("Ledger"));
        assert!(!registration.partitioned);
        assert!(registry.get_registration("other", EventType::of::<Deposited>()).is_none());
    }

    #[test]
    fn conflicting_options_are_rejected() {
        let ledger = Arc::new(Ledger::default());
        let mut registry = HandlerRegistry::new();
        registry
            .register::<Deposited, _>("ledger", ledger.clone(), ProjectionOptions::default())
            .unwrap();

        let result = registry.register::<Withdrawn, _>(
            "ledger",
            ledger,
            ProjectionOptions::default().with_max_degree_of_parallelism(4),
        );
        assert!(matches!(result, Err(ProjectionError::Configuration(_))));
    }

    #[test]
    fn invalid_options_fail_at_registration() {
        let mut registry = HandlerRegistry::new();
        let result = registry.register::<Deposited, _>(
            "ledger",
            Arc::new(Ledger::default()),
            ProjectionOptions::default().with_checkpoint_batch_size(0),
        );
        assert!(matches!(result, Err(ProjectionError::Configuration(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn empty_name_and_duplicates_are_registration_errors() {
        let ledger = Arc::new(Ledger::default());
        let mut registry = HandlerRegistry::new();

        let empty = registry.register::<Deposited, _>(" ", ledger.clone(), ProjectionOptions::default());
        assert!(matches!(empty, Err(ProjectionError::Registration(_))));

        registry
            .register::<Deposited, _>("ledger", ledger.clone(), ProjectionOptions::default())
            .unwrap();
        let duplicate = registry.register::<Deposited, _>("ledger", ledger, ProjectionOptions::default());
        assert!(matches!(duplicate, Err(ProjectionError::Registration(_))));
    }

    #[test]
    fn clear_resets_the_registry() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<Deposited, _>("ledger", Arc::new(Ledger::default()), ProjectionOptions::default())
            .unwrap();
        registry.clear();

        assert!(registry.is_empty());
        assert!(!registry.contains_projection("ledger"));
        assert!(registry.event_types().is_empty());
    }
}
