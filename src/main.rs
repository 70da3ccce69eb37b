use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use slotsync::backend::{LocalBackend, ReservationBackend, Schedule, day_closed_reason};
use slotsync::booking::{BookingData, BookingIntent, BookingOutcome, OptimisticBookingCoordinator};
use slotsync::client::{ReservationClient, SelectError};
use slotsync::clock::Clock;
use slotsync::config::Config;
use slotsync::conflict::{ConflictDetector, WatchTarget};
use slotsync::model::{ClientId, EmployeeId, SlotKey, SlotStatus};
use slotsync::notify::ConflictBus;
use slotsync::store::SlotStore;
use slotsync::timer::{LockTimer, TimerReading};
use slotsync::transport::{self, ConnectionManager};
use slotsync::wire::Customer;

/// One simulated visitor: its connection, its client, its booking coordinator.
struct Visitor {
    name: &'static str,
    bus: Arc<ConflictBus>,
    connection: ConnectionManager,
    client: Arc<ReservationClient>,
    booking: OptimisticBookingCoordinator,
}

impl Visitor {
    fn new(name: &'static str, backend: Arc<LocalBackend>, clock: Clock, config: &Config) -> Self {
        let client_id = ClientId::generate();
        let bus = Arc::new(ConflictBus::new());
        let transport = transport::from_config(backend.clone(), config);
        let store = SlotStore::new(clock, config.optimistic_shadow_ms);
        let connection = ConnectionManager::new(client_id, transport.clone(), backend.clone(), store.clone(), config);
        let client = Arc::new(ReservationClient::new(client_id, transport, store));
        let booking = OptimisticBookingCoordinator::new(backend, client.clone(), bus.clone(), config.request_timeout);
        Self {
            name,
            bus,
            connection,
            client,
            booking,
        }
    }

    async fn book(&self, key: SlotKey) -> BookingOutcome {
        let intent = BookingIntent::new(BookingData {
            service_id: 1,
            slot_key: key,
            customer: Customer {
                name: self.name.into(),
                email: format!("{}@example.com", self.name.to_lowercase()),
                phone: None,
                notes: None,
            },
        });
        self.booking.submit_booking_atomically(&intent).await
    }
}

fn next_open_day(schedule: &Schedule, today: NaiveDate) -> Option<NaiveDate> {
    (1..=14)
        .filter_map(|n| today.checked_add_days(Days::new(n)))
        .find(|&d| day_closed_reason(schedule, d, today).is_none())
}

async fn play(
    a: &Visitor,
    b: &Visitor,
    key: SlotKey,
    config: &Config,
    target: &watch::Sender<WatchTarget>,
    timer: &watch::Receiver<TimerReading>,
) -> Result<(), Box<dyn std::error::Error>> {
    let settle = config.cadence() + Duration::from_millis(200);
    let scope = key.scope();
    a.connection.set_scope(Some(scope.date), Some(scope.employee_id)).await;
    b.connection.set_scope(Some(scope.date), Some(scope.employee_id)).await;
    tokio::time::sleep(settle).await;

    a.client.select_slot(key).await?;
    tokio::time::sleep(settle).await;
    info!("{} holds {key}, {} left", a.name, *timer.borrow());
    match b.client.store().status(key.time, Some(b.client.client_id())) {
        SlotStatus::SoftLocked { .. } => info!("{} sees {} as being booked", b.name, key.time),
        other => warn!("{} sees {} as {other:?}", b.name, key.time),
    }

    target.send_replace(WatchTarget {
        date: Some(scope.date),
        time: Some(key.time),
        employee_id: Some(scope.employee_id),
    });
    match b.client.select_slot(key).await {
        Err(SelectError::Rejected { suggested, .. }) => {
            info!("{} could not select {key}; alternatives: {suggested:?}", b.name)
        }
        other => warn!("{} select of {key}: {other:?}", b.name),
    }

    let outcomes = futures::future::join_all([a.book(key), b.book(key)]).await;
    for (visitor, outcome) in [a, b].into_iter().zip(&outcomes) {
        match outcome {
            BookingOutcome::Success { receipt } => {
                info!("{} booked {key} as appointment {}", visitor.name, receipt.appointment_id)
            }
            BookingOutcome::Conflict { suggested, .. } => {
                info!("{} lost {key}; try {suggested:?}", visitor.name)
            }
            BookingOutcome::Failed(e) => warn!("{} booking failed: {e}", visitor.name),
        }
    }

    tokio::time::sleep(settle).await;
    let booked = b.client.store().booked_slots();
    info!("{} now sees booked slots {booked:?}", b.name);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotsync::observability::init(config.metrics_port)?;

    let clock = Clock::System;
    let schedule = Schedule::default();
    let Some(date) = next_open_day(&schedule, clock.today()) else {
        return Err("no open day in the next two weeks".into());
    };
    let Some(time) = schedule.slot_times().get(2).copied() else {
        return Err("schedule has no bookable slots".into());
    };
    let backend = Arc::new(LocalBackend::new(schedule, config.lock_ttl_ms, clock.clone()));
    info!("slotsync demo, transport={:?}, lock ttl {} ms", config.transport, config.lock_ttl_ms);

    let cancel = CancellationToken::new();
    let reaper = tokio::spawn(slotsync::reaper::run_reaper(
        backend.clone(),
        config.reaper_interval,
        cancel.clone(),
    ));

    let a = Visitor::new("Ada", backend.clone(), clock.clone(), &config);
    let b = Visitor::new("Grace", backend.clone(), clock.clone(), &config);

    let (target_tx, target_rx) = watch::channel(WatchTarget::default());
    let detector = tokio::spawn(
        ConflictDetector::new(b.bus.clone(), clock.clone()).run(
            b.client.store().subscribe(),
            target_rx,
            cancel.clone(),
        ),
    );

    let timer = LockTimer::new(config.lock_ttl_ms, config.urgent_threshold_ms)
        .on_expire(|| warn!("Ada's hold ran out before booking"));
    let (timer_tx, timer_rx) = watch::channel(timer.reading());
    let countdown = tokio::spawn(timer.follow(a.client.store().clone(), timer_tx, cancel.clone()));

    let key = slotsync::model::Scope::new(date, EmployeeId(7)).slot(time);
    tokio::select! {
        result = play(&a, &b, key, &config, &target_tx, &timer_rx) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    info!("shutting down");
    a.client.leave().await;
    b.client.leave().await;
    a.connection.shutdown().await;
    b.connection.shutdown().await;
    cancel.cancel();
    let _ = tokio::join!(reaper, detector, countdown);

    let precheck = backend
        .availability_precheck(slotsync::wire::PrecheckRequest {
            scope: key.scope(),
            exclude_appointment_id: None,
        })
        .await?;
    info!("{} booking(s) on {}", precheck.booking_details.len(), key.scope());
    Ok(())
}
