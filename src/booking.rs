use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::backend::{BackendError, ReservationBackend};
use crate::client::ReservationClient;
use crate::model::{IdempotencyKey, SlotKey, SlotTime};
use crate::notify::{ConflictBus, ConflictSignal};
use crate::observability;
use crate::transport::with_timeout;
use crate::wire::{BookingReceipt, BookingRequest, Customer};

/// What the visitor filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingData {
    pub service_id: u64,
    pub slot_key: SlotKey,
    pub customer: Customer,
}

/// One booking the visitor means to make. Resubmitting the same intent after
/// an unclear failure (timeout, dropped connection) reuses its idempotency
/// key, so the server books at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingIntent {
    data: BookingData,
    idempotency_key: IdempotencyKey,
}

impl BookingIntent {
    pub fn new(data: BookingData) -> Self {
        Self {
            data,
            idempotency_key: IdempotencyKey::generate(),
        }
    }

    pub fn data(&self) -> &BookingData {
        &self.data
    }

    pub fn slot_key(&self) -> SlotKey {
        self.data.slot_key
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        self.idempotency_key
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BookingPhase {
    #[default]
    Idle,
    Booking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOutcome {
    Success { receipt: BookingReceipt },
    /// Lost the slot; alternatives come from the server.
    Conflict {
        slot_key: SlotKey,
        suggested: Vec<SlotTime>,
    },
    Failed(BackendError),
}

/// Observable coordinator state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingState {
    pub phase: BookingPhase,
    pub conflict: Option<(SlotKey, Vec<SlotTime>)>,
    pub error: Option<BackendError>,
    pub receipt: Option<BookingReceipt>,
}

/// Submits bookings one at a time and turns a lost race into a conflict with
/// alternatives instead of a generic failure.
pub struct OptimisticBookingCoordinator {
    backend: Arc<dyn ReservationBackend>,
    client: Arc<ReservationClient>,
    bus: Arc<ConflictBus>,
    request_timeout: Duration,
    state: watch::Sender<BookingState>,
}

impl OptimisticBookingCoordinator {
    pub fn new(
        backend: Arc<dyn ReservationBackend>,
        client: Arc<ReservationClient>,
        bus: Arc<ConflictBus>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            client,
            bus,
            request_timeout,
            state: watch::channel(BookingState::default()).0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<BookingState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> BookingState {
        self.state.borrow().clone()
    }

    pub fn phase(&self) -> BookingPhase {
        self.state.borrow().phase
    }

    /// Create the booking; the server checks and books in one step. There is
    /// no automatic retry: the caller decides, and resubmits the same intent
    /// if the first attempt ended ambiguously.
    pub async fn submit_booking_atomically(&self, intent: &BookingIntent) -> BookingOutcome {
        let started = self.state.send_if_modified(|s| {
            if s.phase == BookingPhase::Booking {
                return false;
            }
            s.phase = BookingPhase::Booking;
            true
        });
        if !started {
            warn!("booking of {} refused, another submission is in progress", intent.slot_key());
            return BookingOutcome::Failed(BackendError::invalid("a booking is already being submitted"));
        }

        let slot_key = intent.slot_key();
        self.bus.send(slot_key.scope(), ConflictSignal::BookingStarted { slot_key });
        let req = BookingRequest {
            service_id: intent.data.service_id,
            slot_key,
            customer: intent.data.customer.clone(),
            client_id: Some(self.client.client_id()),
            idempotency_key: intent.idempotency_key,
        };
        let outcome = match with_timeout(self.request_timeout, self.backend.create_booking(req)).await {
            Ok(receipt) => {
                info!("booked {slot_key} as appointment {}", receipt.appointment_id);
                self.client.forget_selection(slot_key);
                self.bus.send(
                    slot_key.scope(),
                    ConflictSignal::BookingConfirmed { slot_key },
                );
                BookingOutcome::Success { receipt }
            }
            Err(BackendError::SlotTaken {
                slot_key,
                suggested_slots,
            }) => {
                info!("booking of {slot_key} lost the race");
                self.bus.send(
                    slot_key.scope(),
                    ConflictSignal::BookingRejected {
                        slot_key,
                        suggested: suggested_slots.clone(),
                        at: self.client.store().clock().now_ms(),
                    },
                );
                BookingOutcome::Conflict {
                    slot_key,
                    suggested: suggested_slots,
                }
            }
            Err(e) => {
                warn!("booking of {slot_key} failed: {e}");
                self.bus.send(slot_key.scope(), ConflictSignal::BookingFailed { slot_key });
                BookingOutcome::Failed(e)
            }
        };
        metrics::counter!(observability::BOOKINGS_TOTAL, "result" => observability::booking_label(&outcome))
            .increment(1);

        self.state.send_modify(|s| {
            s.phase = BookingPhase::Idle;
            match &outcome {
                BookingOutcome::Success { receipt } => {
                    s.conflict = None;
                    s.error = None;
                    s.receipt = Some(*receipt);
                }
                BookingOutcome::Conflict { slot_key, suggested } => {
                    s.conflict = Some((*slot_key, suggested.clone()));
                    s.error = None;
                }
                BookingOutcome::Failed(e) => s.error = Some(e.clone()),
            }
        });
        outcome
    }
}
