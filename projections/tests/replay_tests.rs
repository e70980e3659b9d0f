//! Integration tests for replaying historical events.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use foldline_core::checkpoint::CheckpointKey;
use foldline_core::error::ProjectionError;
use foldline_core::event::EventEnvelope;
use foldline_core::options::{CheckpointMode, ProjectionOptions, ReplayOptions};
use foldline_core::projection::ProcessingMode;
use foldline_core::shutdown::{ShutdownSignal, shutdown_channel};
use foldline_projections::{
    HandlerRegistry, InMemoryProjectionMonitor, ProjectionMonitor, ReplayReport, ReplayService,
};
use foldline_testing::{InMemoryEventStore, MockProjection, RecordingCheckpointStore};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Deposited {
    account: &'static str,
    seq: u32,
}

#[derive(Debug, Clone)]
struct Audited;

struct Fixture {
    handler: Arc<MockProjection<Deposited>>,
    checkpoints: Arc<RecordingCheckpointStore>,
    store: Arc<InMemoryEventStore>,
    service: ReplayService,
}

impl Fixture {
    fn new(handler: MockProjection<Deposited>, events: impl IntoIterator<Item = EventEnvelope>) -> Self {
        let handler = Arc::new(handler);
        let mut registry = HandlerRegistry::new();
        registry
            .register_partitioned::<Deposited, _>("ledger", Arc::clone(&handler), ProjectionOptions::default())
            .unwrap();

        let checkpoints = Arc::new(RecordingCheckpointStore::new());
        let store = Arc::new(InMemoryEventStore::new());
        store.seed("ledger", events);

        let service = ReplayService::new(Arc::new(registry), Arc::clone(&checkpoints) as _)
            .with_event_store(Arc::clone(&store) as _);
        Self {
            handler,
            checkpoints,
            store,
            service,
        }
    }

    fn seeded(count: u32) -> Self {
        Self::new(MockProjection::new(), deposits("a", count))
    }

    async fn replay(&self, options: ReplayOptions) -> ReplayReport {
        self.service
            .replay("ledger", &options, ShutdownSignal::never())
            .await
            .unwrap()
    }

    fn positions(&self) -> Vec<u64> {
        self.handler.invocations().iter().map(|i| i.position).collect()
    }

    fn saves(&self) -> Vec<u64> {
        self.checkpoints.saves_for(&CheckpointKey::for_projection("ledger"))
    }
}

fn deposits(account: &'static str, count: u32) -> Vec<EventEnvelope> {
    (0..count)
        .map(|seq| EventEnvelope::new(Deposited { account, seq }))
        .collect()
}

#[tokio::test]
async fn replays_from_an_explicit_position() {
    let fixture = Fixture::seeded(5);

    let report = fixture.replay(ReplayOptions::new().from_position(2)).await;

    assert_eq!(fixture.positions(), vec![2, 3, 4]);
    assert_eq!(report.start_position, 2);
    assert_eq!(report.events_processed, 3);
    assert_eq!(report.last_position, Some(4));
}

#[tokio::test]
async fn stops_after_the_upper_bound() {
    let fixture = Fixture::seeded(4);

    let report = fixture
        .replay(ReplayOptions::new().from_position(0).to_position(1))
        .await;

    assert_eq!(fixture.positions(), vec![0, 1]);
    assert_eq!(report.events_read, 2);
    assert_eq!(report.events_processed, 2);
}

#[tokio::test]
async fn dry_run_processes_without_touching_checkpoints() {
    let fixture = Fixture::seeded(5);

    let report = fixture.replay(ReplayOptions::new().dry_run()).await;

    assert_eq!(report.events_processed, 5);
    assert!(report.dry_run);
    assert!(fixture.checkpoints.saves().is_empty());
    assert!(fixture.checkpoints.resets().is_empty());
    assert!(
        fixture
            .handler
            .invocations()
            .iter()
            .all(|i| i.mode == ProcessingMode::Replay { dry_run: true })
    );
}

#[tokio::test]
async fn normal_mode_writes_every_batch_and_the_tail() {
    let fixture = Fixture::seeded(5);

    let report = fixture.replay(ReplayOptions::new().with_batch_size(2)).await;

    assert_eq!(fixture.saves(), vec![1, 3, 4]);
    assert_eq!(report.checkpoints_written, 3);
    assert_eq!(fixture.checkpoints.resets(), vec![CheckpointKey::for_projection("ledger")]);
}

#[tokio::test]
async fn final_only_writes_once() {
    let fixture = Fixture::seeded(5);

    fixture
        .replay(
            ReplayOptions::new()
                .with_batch_size(2)
                .with_checkpoint_mode(CheckpointMode::FinalOnly),
        )
        .await;

    assert_eq!(fixture.saves(), vec![4]);
}

#[tokio::test]
async fn checkpoint_mode_none_never_writes_or_resets() {
    let fixture = Fixture::seeded(3);
    fixture
        .checkpoints
        .set(&CheckpointKey::for_projection("ledger"), 7);

    fixture
        .replay(ReplayOptions::new().with_checkpoint_mode(CheckpointMode::None))
        .await;

    assert!(fixture.checkpoints.saves().is_empty());
    assert!(fixture.checkpoints.resets().is_empty());
    assert_eq!(fixture.checkpoints.get(&CheckpointKey::for_projection("ledger")), Some(7));
}

#[tokio::test]
async fn from_checkpoint_resumes_after_the_stored_position() {
    let fixture = Fixture::seeded(5);
    fixture
        .checkpoints
        .set(&CheckpointKey::for_projection("ledger"), 1);

    let report = fixture.replay(ReplayOptions::new().from_checkpoint()).await;

    assert_eq!(report.start_position, 2);
    assert_eq!(fixture.positions(), vec![2, 3, 4]);
    assert!(fixture.checkpoints.resets().is_empty());
}

#[tokio::test]
async fn explicit_position_wins_over_checkpoint() {
    let fixture = Fixture::seeded(5);
    fixture
        .checkpoints
        .set(&CheckpointKey::for_projection("ledger"), 1);

    let report = fixture
        .replay(ReplayOptions::new().from_checkpoint().from_position(4))
        .await;

    assert_eq!(report.start_position, 4);
    assert_eq!(fixture.positions(), vec![4]);
}

#[tokio::test]
async fn partition_filter_keeps_only_matching_events() {
    let handler =
        MockProjection::new().partitioned_by(|event: &Deposited| Ok(event.account.to_string()));
    let events = (0..6).map(|seq| {
        let account = if seq % 2 == 0 { "a" } else { "b" };
        EventEnvelope::new(Deposited { account, seq })
    });
    let fixture = Fixture::new(handler, events);

    let report = fixture.replay(ReplayOptions::new().for_partition("a")).await;

    let seqs: Vec<u32> = fixture.handler.succeeded_events().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![0, 2, 4]);
    assert_eq!(report.events_filtered, 3);
    assert_eq!(
        fixture.checkpoints.saves_for(&CheckpointKey::for_partition("ledger", "a")),
        vec![4]
    );
}

#[tokio::test]
async fn events_of_unhandled_types_are_filtered() {
    let mut events = deposits("a", 2);
    events.insert(1, EventEnvelope::new(Audited));
    let fixture = Fixture::new(MockProjection::new(), events);

    let report = fixture.replay(ReplayOptions::new()).await;

    assert_eq!(report.events_read, 3);
    assert_eq!(report.events_processed, 2);
    assert_eq!(report.events_filtered, 1);
    assert_eq!(fixture.positions(), vec![0, 2]);
}

#[tokio::test]
async fn handler_failures_are_logged_and_skipped_over() {
    let handler = MockProjection::new().failing_when(|event: &Deposited, _| event.seq == 1);
    let fixture = Fixture::new(handler, deposits("a", 4));

    let report = fixture.replay(ReplayOptions::new()).await;

    assert_eq!(report.events_processed, 4);
    assert_eq!(report.handler_failures, 1);
    assert_eq!(fixture.handler.attempts(), 4);
    assert_eq!(fixture.saves(), vec![3]);
}

#[tokio::test]
async fn failing_key_function_skips_the_event_without_invoking_the_handler() {
    let handler = MockProjection::new().partitioned_by(|event: &Deposited| {
        if event.account.is_empty() {
            Err(ProjectionError::processing("no account"))
        } else {
            Ok(event.account.to_string())
        }
    });
    let events = [
        EventEnvelope::new(Deposited { account: "", seq: 0 }),
        EventEnvelope::new(Deposited { account: "a", seq: 1 }),
    ];
    let fixture = Fixture::new(handler, events);

    let report = fixture.replay(ReplayOptions::new()).await;

    assert_eq!(fixture.handler.attempts(), 1);
    assert_eq!(fixture.handler.invocations()[0].partition, "a");
    assert_eq!(report.handler_failures, 1);
    assert_eq!(report.events_processed, 2);
    assert_eq!(report.last_position, Some(1));
    assert_eq!(fixture.saves(), vec![1]);
}

#[tokio::test]
async fn processed_events_are_booked_under_their_partition() {
    let handler = Arc::new(
        MockProjection::new().partitioned_by(|event: &Deposited| Ok(event.account.to_string())),
    );
    let mut registry = HandlerRegistry::new();
    registry
        .register_partitioned::<Deposited, _>("ledger", Arc::clone(&handler), ProjectionOptions::default())
        .unwrap();
    let store = Arc::new(InMemoryEventStore::new());
    store.seed(
        "ledger",
        ["a", "b", "a"].into_iter().enumerate().map(|(seq, account)| {
            EventEnvelope::new(Deposited {
                account,
                seq: u32::try_from(seq).unwrap(),
            })
        }),
    );
    let monitor = Arc::new(InMemoryProjectionMonitor::new());
    let service = ReplayService::new(Arc::new(registry), Arc::new(RecordingCheckpointStore::new()))
        .with_event_store(store)
        .with_monitor(Arc::clone(&monitor) as _);

    service
        .replay("ledger", &ReplayOptions::new(), ShutdownSignal::never())
        .await
        .unwrap();

    assert_eq!(monitor.get_metrics("ledger", Some("a")).unwrap().events_processed, 2);
    assert_eq!(monitor.get_metrics("ledger", Some("b")).unwrap().events_processed, 1);
    assert!(monitor.get_metrics("ledger", Some("_default")).is_none_or(|m| m.events_processed == 0));
}

#[tokio::test]
async fn unknown_projection_is_a_registration_error() {
    let fixture = Fixture::seeded(3);

    let error = fixture
        .service
        .replay("missing", &ReplayOptions::new(), ShutdownSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(error, ProjectionError::Registration(_)));
    assert_eq!(fixture.handler.attempts(), 0);
}

#[tokio::test]
async fn invalid_options_are_rejected_before_reading() {
    let fixture = Fixture::seeded(3);

    for options in [
        ReplayOptions::new().from_position(3).to_position(1),
        ReplayOptions::new().with_batch_size(0),
    ] {
        let error = fixture
            .service
            .replay("ledger", &options, ShutdownSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(error, ProjectionError::Configuration(_)));
    }

    assert_eq!(fixture.handler.attempts(), 0);
    assert!(fixture.checkpoints.resets().is_empty());
}

#[tokio::test]
async fn without_an_event_store_nothing_happens() {
    let handler = Arc::new(MockProjection::<Deposited>::new());
    let mut registry = HandlerRegistry::new();
    registry
        .register::<Deposited, _>("ledger", Arc::clone(&handler), ProjectionOptions::default())
        .unwrap();
    let checkpoints = Arc::new(RecordingCheckpointStore::new());
    let service = ReplayService::new(Arc::new(registry), Arc::clone(&checkpoints) as _);

    let report = service
        .replay("ledger", &ReplayOptions::new(), ShutdownSignal::never())
        .await
        .unwrap();

    assert_eq!(report.events_read, 0);
    assert_eq!(handler.attempts(), 0);
    assert!(checkpoints.resets().is_empty());
}

#[tokio::test]
async fn read_failure_flushes_progress_then_fails() {
    let fixture = Fixture::seeded(5);
    fixture.store.fail_reads_at(Some(3));

    let error = fixture
        .service
        .replay("ledger", &ReplayOptions::new().with_batch_size(2), ShutdownSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(error, ProjectionError::EventStore(_)));
    assert_eq!(fixture.positions(), vec![0, 1, 2]);
    assert_eq!(fixture.saves(), vec![1, 2]);
}

#[tokio::test]
async fn checkpoint_save_failure_is_returned() {
    let fixture = Fixture::seeded(3);
    fixture.checkpoints.fail_saves(true);

    let error = fixture
        .service
        .replay("ledger", &ReplayOptions::new(), ShutdownSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(error, ProjectionError::Checkpoint(_)));
}

#[tokio::test]
async fn cancelled_replay_reports_cancellation() {
    let fixture = Fixture::seeded(5);
    let (handle, signal) = shutdown_channel();
    handle.shutdown();

    let report = fixture
        .service
        .replay("ledger", &ReplayOptions::new(), signal)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.events_processed, 0);
    assert!(fixture.saves().is_empty());
}

#[tokio::test]
async fn replaying_twice_is_idempotent_for_checkpoints() {
    let fixture = Fixture::seeded(3);

    let first = fixture.replay(ReplayOptions::new()).await;
    let second = fixture.replay(ReplayOptions::new()).await;

    assert_eq!(first.last_position, second.last_position);
    assert_eq!(fixture.saves(), vec![2, 2]);
    assert_eq!(fixture.checkpoints.resets().len(), 2);
}
