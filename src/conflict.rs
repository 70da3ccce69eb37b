//! Watches the slot the visitor is about to book and raises a conflict the
//! moment someone else gets it, from either the poll or a rejected booking.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::model::{ConflictEvent, ConflictKind, EmployeeId, Scope, SlotKey, SlotTime};
use crate::notify::{ConflictBus, ConflictSignal};
use crate::observability;
use crate::store::SlotState;

/// What the visitor currently has picked. Any missing part means nothing is watched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchTarget {
    pub date: Option<NaiveDate>,
    pub time: Option<SlotTime>,
    pub employee_id: Option<EmployeeId>,
}

impl WatchTarget {
    pub fn slot_key(&self) -> Option<SlotKey> {
        Some(Scope::from_parts(self.date, self.employee_id)?.slot(self.time?))
    }
}

pub struct ConflictDetector {
    bus: Arc<ConflictBus>,
    clock: Clock,
    watched: Option<SlotKey>,
    conflict: Option<ConflictEvent>,
    suggestions: Vec<SlotTime>,
    /// Slots this client booked itself; booked state there is not a loss.
    own_bookings: HashSet<SlotKey>,
    /// Slot of our own booking request still awaiting its answer.
    booking: Option<SlotKey>,
}

impl ConflictDetector {
    pub fn new(bus: Arc<ConflictBus>, clock: Clock) -> Self {
        Self {
            bus,
            clock,
            watched: None,
            conflict: None,
            suggestions: Vec::new(),
            own_bookings: HashSet::new(),
            booking: None,
        }
    }

    pub fn watched(&self) -> Option<SlotKey> {
        self.watched
    }

    pub fn is_active(&self) -> bool {
        self.watched.is_some()
    }

    pub fn conflict(&self) -> Option<&ConflictEvent> {
        self.conflict.as_ref()
    }

    pub fn suggestions(&self) -> &[SlotTime] {
        &self.suggestions
    }

    /// Retarget. Switching slots drops any conflict shown for the old one; an
    /// incomplete target deactivates the detector.
    pub fn watch(&mut self, date: Option<NaiveDate>, time: Option<SlotTime>, employee_id: Option<EmployeeId>) {
        let next = WatchTarget {
            date,
            time,
            employee_id,
        }
        .slot_key();
        if next == self.watched {
            return;
        }
        self.clear();
        self.watched = next;
        match next {
            Some(key) => debug!("watching {key} for conflicts"),
            None => debug!("conflict detection inactive"),
        }
    }

    fn clear(&mut self) {
        self.suggestions.clear();
        if self.conflict.take().is_some()
            && let Some(key) = self.watched
        {
            self.bus.send(key.scope(), ConflictSignal::ConflictsCleared { scope: key.scope() });
        }
    }

    fn raise(&mut self, key: SlotKey, kind: ConflictKind, at: i64) -> ConflictEvent {
        let event = ConflictEvent {
            slot_key: key,
            detected_at: at,
            kind,
        };
        info!("conflict on {key}: {kind:?}");
        metrics::counter!(observability::CONFLICTS_TOTAL, "kind" => kind_label(kind)).increment(1);
        self.conflict = Some(event);
        self.bus.send(key.scope(), ConflictSignal::ConflictDetected(event));
        event
    }

    fn suggest(&mut self, key: SlotKey, alternatives: Vec<SlotTime>) {
        if alternatives.is_empty() || alternatives == self.suggestions {
            return;
        }
        self.suggestions = alternatives.clone();
        self.bus.send(
            key.scope(),
            ConflictSignal::SuggestedSlots {
                slot_key: key,
                alternatives,
            },
        );
    }

    /// Compare the watched slot against a store state. Returns the event when
    /// this state is what turned the slot into a conflict.
    pub fn observe(&mut self, state: &SlotState) -> Option<ConflictEvent> {
        let key = self.watched?;
        if state.scope != Some(key.scope()) {
            return None;
        }
        let taken = state.booked_slots.contains(key.time)
            && !state.booked_slots.is_all()
            && !self.own_bookings.contains(&key)
            && self.booking != Some(key);

        match (self.conflict.map(|c| c.kind), taken) {
            (None, true) => Some(self.raise(key, ConflictKind::SlotConflict, self.clock.now_ms())),
            // The booking went away (cancelled). A rejection stays until the visitor moves on.
            (Some(ConflictKind::SlotConflict), false) => {
                info!("{key} is free again");
                self.clear();
                None
            }
            _ => None,
        }
    }

    /// React to signals other components publish. Returns a newly raised conflict.
    pub fn accept(&mut self, signal: &ConflictSignal) -> Option<ConflictEvent> {
        match signal {
            ConflictSignal::BookingStarted { slot_key } => {
                self.booking = Some(*slot_key);
                None
            }
            ConflictSignal::BookingFailed { slot_key } => {
                if self.booking == Some(*slot_key) {
                    self.booking = None;
                }
                None
            }
            ConflictSignal::BookingRejected { slot_key, suggested, at } => {
                if self.booking == Some(*slot_key) {
                    self.booking = None;
                }
                if self.watched != Some(*slot_key) {
                    return None;
                }
                let raised = match self.conflict {
                    Some(_) => None,
                    None => Some(self.raise(*slot_key, ConflictKind::SlotTaken, *at)),
                };
                self.suggest(*slot_key, suggested.clone());
                raised
            }
            ConflictSignal::BookingConfirmed { slot_key } => {
                if self.booking == Some(*slot_key) {
                    self.booking = None;
                }
                self.own_bookings.insert(*slot_key);
                if self.watched == Some(*slot_key) {
                    self.clear();
                }
                None
            }
            ConflictSignal::ConflictDetected(_)
            | ConflictSignal::SuggestedSlots { .. }
            | ConflictSignal::ConflictsCleared { .. } => None,
        }
    }

    /// Drive the detector from a store subscription, the conflict bus and the
    /// visitor's current pick until cancelled.
    pub async fn run(
        mut self,
        mut store_rx: watch::Receiver<SlotState>,
        mut target_rx: watch::Receiver<WatchTarget>,
        cancel: CancellationToken,
    ) {
        let mut bus_rx = self.retarget(*target_rx.borrow_and_update());
        self.observe(&store_rx.borrow_and_update());

        loop {
            // Bus before store: a booking we started must be known before
            // the poll that shows it booked is judged.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                signal = recv(&mut bus_rx) => match signal {
                    Ok(signal) => {
                        self.accept(&signal);
                        // a failed booking may leave a foreign booking already on screen
                        if matches!(signal, ConflictSignal::BookingFailed { .. }) {
                            self.observe(&store_rx.borrow());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("conflict detector skipped {n} signals");
                    }
                    Err(broadcast::error::RecvError::Closed) => bus_rx = None,
                },
                changed = target_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    bus_rx = self.retarget(*target_rx.borrow_and_update());
                    self.observe(&store_rx.borrow());
                }
                changed = store_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = store_rx.borrow_and_update().clone();
                    self.observe(&state);
                }
            }
        }
        debug!("conflict detector stopped");
    }

    fn retarget(&mut self, target: WatchTarget) -> Option<broadcast::Receiver<ConflictSignal>> {
        self.watch(target.date, target.time, target.employee_id);
        self.watched.map(|key| self.bus.subscribe(key.scope()))
    }
}

async fn recv(
    rx: &mut Option<broadcast::Receiver<ConflictSignal>>,
) -> Result<ConflictSignal, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn kind_label(kind: ConflictKind) -> &'static str {
    match kind {
        ConflictKind::SlotTaken => "slot_taken",
        ConflictKind::SlotConflict => "slot_conflict",
    }
}
