use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use slotsync::backend::{BackendError, LocalBackend, ReservationBackend, Schedule};
use slotsync::booking::{BookingData, BookingIntent, BookingOutcome, OptimisticBookingCoordinator};
use slotsync::client::{ReservationClient, SelectError, SelectOutcome};
use slotsync::clock::Clock;
use slotsync::config::{Config, TransportKind};
use slotsync::conflict::{ConflictDetector, WatchTarget};
use slotsync::model::*;
use slotsync::notify::{ConflictBus, ConflictSignal};
use slotsync::store::SlotStore;
use slotsync::transport::{self, ConnectionManager};
use slotsync::wire::{
    BookingReceipt, BookingRequest, Customer, DeselectRequest, PollRequest, PollResponse, Precheck,
    PrecheckRequest, SelectRequest,
};

// ── Test infrastructure ──────────────────────────────────────

// 2025-09-19T08:00:00Z, the day before the scenario date
const START: Ms = 1_758_268_800_000;
const TTL: Ms = 600_000;

fn t(s: &str) -> SlotTime {
    s.parse().unwrap()
}

fn scope() -> Scope {
    Scope::new(NaiveDate::from_ymd_opt(2025, 9, 20).unwrap(), EmployeeId(7))
}

struct Visitor {
    bus: Arc<ConflictBus>,
    connection: ConnectionManager,
    client: Arc<ReservationClient>,
    booking: OptimisticBookingCoordinator,
}

impl Visitor {
    fn id(&self) -> ClientId {
        self.client.client_id()
    }

    fn status(&self, time: &str) -> SlotStatus {
        self.client.store().status(t(time), Some(self.id()))
    }

    async fn enter(&self) {
        self.connection
            .set_scope(Some(scope().date), Some(scope().employee_id))
            .await;
    }

    async fn book(&self, time: &str, name: &str) -> BookingOutcome {
        let intent = BookingIntent::new(BookingData {
            service_id: 1,
            slot_key: scope().slot(t(time)),
            customer: Customer {
                name: name.into(),
                email: format!("{}@example.com", name.to_lowercase()),
                phone: None,
                notes: None,
            },
        });
        self.booking.submit_booking_atomically(&intent).await
    }
}

struct World {
    backend: Arc<LocalBackend>,
    clock: Clock,
    config: Config,
}

impl World {
    fn new(transport: TransportKind) -> Self {
        let clock = Clock::manual(START);
        let config = Config {
            transport,
            lock_ttl_ms: TTL,
            ..Config::default()
        };
        Self {
            backend: Arc::new(LocalBackend::new(Schedule::default(), TTL, clock.clone())),
            clock,
            config,
        }
    }

    fn visitor(&self) -> Visitor {
        self.visitor_on(self.backend.clone())
    }

    fn visitor_on(&self, backend: Arc<dyn ReservationBackend>) -> Visitor {
        let id = ClientId::generate();
        let bus = Arc::new(ConflictBus::new());
        let transport = transport::from_config(backend.clone(), &self.config);
        let store = SlotStore::new(self.clock.clone(), self.config.optimistic_shadow_ms);
        let connection = ConnectionManager::new(
            id,
            transport.clone(),
            backend.clone(),
            store.clone(),
            &self.config,
        );
        let client = Arc::new(ReservationClient::new(id, transport, store));
        let booking = OptimisticBookingCoordinator::new(
            backend,
            client.clone(),
            bus.clone(),
            self.config.request_timeout,
        );
        Visitor {
            bus,
            connection,
            client,
            booking,
        }
    }

    /// Let every visitor poll at least once more.
    async fn next_poll(&self) {
        tokio::time::sleep(self.config.cadence() + Duration::from_millis(10)).await;
    }
}

/// Commits bookings at once but answers only after `delay`.
struct SlowReply {
    inner: Arc<LocalBackend>,
    delay: Duration,
}

#[async_trait]
impl ReservationBackend for SlowReply {
    async fn select_slot(&self, req: SelectRequest) -> Result<(), BackendError> {
        self.inner.select_slot(req).await
    }

    async fn deselect_slot(&self, req: DeselectRequest) -> Result<(), BackendError> {
        self.inner.deselect_slot(req).await
    }

    async fn poll(&self, req: PollRequest) -> Result<PollResponse, BackendError> {
        self.inner.poll(req).await
    }

    async fn create_booking(&self, req: BookingRequest) -> Result<BookingReceipt, BackendError> {
        let receipt = self.inner.create_booking(req).await?;
        tokio::time::sleep(self.delay).await;
        Ok(receipt)
    }

    async fn availability_precheck(&self, req: PrecheckRequest) -> Result<Precheck, BackendError> {
        self.inner.availability_precheck(req).await
    }
}

// ── Scenarios ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn selection_shows_as_being_booked_to_others() {
    let world = World::new(TransportKind::Interval);
    let (a, b) = (world.visitor(), world.visitor());
    a.enter().await;
    b.enter().await;
    world.next_poll().await;

    assert_eq!(a.client.select_slot(scope().slot(t("10:00"))).await.unwrap(), SelectOutcome::Selected);
    world.next_poll().await;

    let state = b.client.store().state();
    assert_eq!(state.active_selections.iter().copied().collect::<Vec<_>>(), vec![t("10:00")]);
    assert!(!state.booked_slots.contains(t("10:00")));
    assert_eq!(
        b.status("10:00"),
        SlotStatus::SoftLocked { client_id: None, expires_at: None }
    );
    assert!(!b.status("10:00").is_selectable());
    assert!(matches!(
        a.status("10:00"),
        SlotStatus::SoftLocked { client_id: Some(id), .. } if id == a.id()
    ));

    a.connection.shutdown().await;
    b.connection.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn expired_selection_frees_the_slot() {
    let world = World::new(TransportKind::Interval);
    let (a, b) = (world.visitor(), world.visitor());
    b.enter().await;

    // A holds 10:00 but is not polling, so nothing renews the hold
    a.client.select_slot(scope().slot(t("10:00"))).await.unwrap();
    world.next_poll().await;
    assert!(b.client.store().active_selections().contains(&t("10:00")));

    world.clock.advance(TTL);
    world.next_poll().await;
    let state = b.client.store().state();
    assert!(state.active_selections.is_empty());
    assert!(!state.booked_slots.contains(t("10:00")));
    assert_eq!(b.status("10:00"), SlotStatus::Available);

    assert_eq!(b.client.select_slot(scope().slot(t("10:00"))).await.unwrap(), SelectOutcome::Selected);
    b.connection.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn polling_keeps_an_active_hold_alive() {
    let world = World::new(TransportKind::Interval);
    let (a, b) = (world.visitor(), world.visitor());
    a.enter().await;
    b.enter().await;
    a.client.select_slot(scope().slot(t("10:00"))).await.unwrap();

    // half a TTL at a time, with A polling in between
    for _ in 0..4 {
        world.clock.advance(TTL / 2);
        world.next_poll().await;
    }
    assert!(b.client.store().active_selections().contains(&t("10:00")));

    a.connection.shutdown().await;
    b.connection.shutdown().await;
}

#[tokio::test]
async fn concurrent_bookings_one_wins_one_gets_alternatives() {
    let world = World::new(TransportKind::Interval);
    let (a, b) = (world.visitor(), world.visitor());

    let (first, second) = tokio::join!(a.book("10:00", "Ada"), b.book("10:00", "Grace"));
    let outcomes = [first, second];

    let wins: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            BookingOutcome::Success { receipt } => Some(receipt.appointment_id),
            _ => None,
        })
        .collect();
    assert_eq!(wins.len(), 1);

    let conflict = outcomes
        .iter()
        .find_map(|o| match o {
            BookingOutcome::Conflict { slot_key, suggested } => Some((*slot_key, suggested.clone())),
            _ => None,
        })
        .expect("the loser gets slot_taken");
    assert_eq!(conflict.0, scope().slot(t("10:00")));
    assert!(conflict.1.iter().any(|time| *time != t("10:00")));
}

#[tokio::test(start_paused = true)]
async fn rejected_select_leaves_view_as_it_was() {
    let world = World::new(TransportKind::Interval);
    let (a, b) = (world.visitor(), world.visitor());
    b.enter().await;
    a.client.select_slot(scope().slot(t("10:00"))).await.unwrap();
    world.next_poll().await;

    let err = b.client.select_slot(scope().slot(t("10:00"))).await.unwrap_err();
    assert!(matches!(err, SelectError::Rejected { ref suggested, .. } if !suggested.is_empty()));
    assert_eq!(b.client.current_selection(), None);
    assert_eq!(
        b.status("10:00"),
        SlotStatus::SoftLocked { client_id: None, expires_at: None }
    );
    b.connection.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn watcher_learns_of_lost_slot_once() {
    let world = World::new(TransportKind::Interval);
    let (a, b) = (world.visitor(), world.visitor());
    b.enter().await;

    let mut signals = b.bus.subscribe(scope());
    let (target_tx, target_rx) = watch::channel(WatchTarget {
        date: Some(scope().date),
        time: Some(t("10:00")),
        employee_id: Some(scope().employee_id),
    });
    let cancel = CancellationToken::new();
    let detector = tokio::spawn(
        ConflictDetector::new(b.bus.clone(), world.clock.clone()).run(
            b.client.store().subscribe(),
            target_rx,
            cancel.clone(),
        ),
    );
    world.next_poll().await;

    assert!(matches!(a.book("10:00", "Ada").await, BookingOutcome::Success { .. }));
    world.next_poll().await;
    world.next_poll().await;

    let mut detected = Vec::new();
    while let Ok(signal) = signals.try_recv() {
        if let ConflictSignal::ConflictDetected(event) = signal {
            detected.push(event);
        }
    }
    assert_eq!(detected.len(), 1);
    assert_eq!(detected[0].kind, ConflictKind::SlotConflict);
    assert_eq!(detected[0].slot_key, scope().slot(t("10:00")));
    assert_eq!(b.status("10:00"), SlotStatus::Booked { appointment_id: None });

    drop(target_tx);
    cancel.cancel();
    detector.await.unwrap();
    b.connection.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn own_booking_seen_before_its_reply_is_not_a_loss() {
    let world = World::new(TransportKind::Interval);
    let slow = Arc::new(SlowReply {
        inner: world.backend.clone(),
        delay: Duration::from_secs(3),
    });
    let b = world.visitor_on(slow);
    b.enter().await;

    let mut signals = b.bus.subscribe(scope());
    let (target_tx, target_rx) = watch::channel(WatchTarget {
        date: Some(scope().date),
        time: Some(t("10:00")),
        employee_id: Some(scope().employee_id),
    });
    let cancel = CancellationToken::new();
    let detector = tokio::spawn(
        ConflictDetector::new(b.bus.clone(), world.clock.clone()).run(
            b.client.store().subscribe(),
            target_rx,
            cancel.clone(),
        ),
    );
    world.next_poll().await;
    b.client.select_slot(scope().slot(t("10:00"))).await.unwrap();

    // polls during the slow reply already show 10:00 booked
    assert!(matches!(b.book("10:00", "Grace").await, BookingOutcome::Success { .. }));
    world.next_poll().await;

    let mut seen = Vec::new();
    while let Ok(signal) = signals.try_recv() {
        seen.push(signal);
    }
    assert!(
        !seen.iter().any(|s| matches!(s, ConflictSignal::ConflictDetected(_))),
        "own booking raised a conflict: {seen:?}"
    );
    assert!(seen.contains(&ConflictSignal::BookingConfirmed {
        slot_key: scope().slot(t("10:00"))
    }));
    assert_eq!(b.status("10:00"), SlotStatus::Booked { appointment_id: None });

    drop(target_tx);
    cancel.cancel();
    detector.await.unwrap();
    b.connection.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_transport_carries_selects() {
    let world = World::new(TransportKind::Heartbeat);
    let (a, b) = (world.visitor(), world.visitor());
    a.enter().await;
    b.enter().await;

    let outcome = a.client.select_slot(scope().slot(t("10:00"))).await.unwrap();
    assert_eq!(outcome, SelectOutcome::Selected);
    world.next_poll().await;

    assert!(b.client.store().active_selections().contains(&t("10:00")));
    assert!(a.client.store().is_connected());

    a.client.leave().await;
    world.next_poll().await;
    assert!(b.client.store().active_selections().is_empty());

    a.connection.shutdown().await;
    b.connection.shutdown().await;
}
