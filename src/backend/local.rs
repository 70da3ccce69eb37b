use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::limits::*;
use crate::model::*;
use crate::wire::*;

use super::schedule::{Schedule, day_closed_reason, suggest_alternatives};
use super::{BackendError, ReservationBackend};

pub type SharedScopeState = Arc<RwLock<ScopeState>>;

/// A client's soft hold on one time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftLock {
    pub time: SlotTime,
    pub selected_at: Ms,
    pub expires_at: Ms,
}

/// An accepted booking, kept so a retry with the same key gets the same answer.
#[derive(Debug, Clone, Copy)]
struct Remembered {
    receipt: BookingReceipt,
    accepted_at: Ms,
}

impl SoftLock {
    pub fn is_live(&self, now: Ms) -> bool {
        self.expires_at > now
    }
}

/// Everything the server knows about one (date, employee).
#[derive(Debug, Clone)]
pub struct ScopeState {
    pub scope: Scope,
    /// At most one hold per client.
    pub holds: HashMap<ClientId, SoftLock>,
    pub bookings: BTreeMap<SlotTime, AppointmentId>,
    /// Staff-side locks.
    pub blocked: BTreeSet<SlotTime>,
}

impl ScopeState {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            holds: HashMap::new(),
            bookings: BTreeMap::new(),
            blocked: BTreeSet::new(),
        }
    }

    /// Place or move `client`'s hold; the previous one in this scope is released.
    pub fn place(&mut self, client: ClientId, time: SlotTime, now: Ms, expires_at: Ms) {
        self.holds.insert(
            client,
            SoftLock {
                time,
                selected_at: now,
                expires_at,
            },
        );
    }

    /// Live holder of `time`, if any.
    pub fn holder_of(&self, time: SlotTime, now: Ms) -> Option<ClientId> {
        self.holds
            .iter()
            .find(|(_, lock)| lock.time == time && lock.is_live(now))
            .map(|(client, _)| *client)
    }

    /// Booked (unless excluded), staff-locked, or held live by someone other than `client`.
    pub fn is_taken(
        &self,
        time: SlotTime,
        client: Option<ClientId>,
        exclude: Option<AppointmentId>,
        now: Ms,
    ) -> bool {
        if let Some(id) = self.bookings.get(&time)
            && Some(*id) != exclude
        {
            return true;
        }
        if self.blocked.contains(&time) {
            return true;
        }
        self.holds
            .iter()
            .any(|(holder, lock)| lock.time == time && lock.is_live(now) && Some(*holder) != client)
    }
}

/// In-process reference implementation of the reservation server.
///
/// Scopes are independent; every mutation takes the scope's write lock, which
/// makes check-then-book atomic per (date, employee).
pub struct LocalBackend {
    scopes: DashMap<Scope, SharedScopeState>,
    /// Reverse lookup: appointment id → slot.
    appointments: DashMap<AppointmentId, SlotKey>,
    idempotency: DashMap<IdempotencyKey, Remembered>,
    schedule: Schedule,
    lock_ttl_ms: Ms,
    clock: Clock,
    seq: AtomicU64,
    next_appointment: AtomicU64,
}

impl LocalBackend {
    pub fn new(schedule: Schedule, lock_ttl_ms: Ms, clock: Clock) -> Self {
        Self {
            scopes: DashMap::new(),
            appointments: DashMap::new(),
            idempotency: DashMap::new(),
            schedule,
            lock_ttl_ms,
            clock,
            seq: AtomicU64::new(0),
            next_appointment: AtomicU64::new(1),
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn scope_state(&self, scope: Scope) -> SharedScopeState {
        self.scopes
            .entry(scope)
            .or_insert_with(|| Arc::new(RwLock::new(ScopeState::new(scope))))
            .value()
            .clone()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reject closed days, off-grid times, and times already gone today.
    fn check_bookable(&self, key: &SlotKey) -> Result<(), BackendError> {
        let today = self.clock.today();
        if let Some(reason) = day_closed_reason(&self.schedule, key.date, today) {
            return Err(BackendError::Unavailable { reason });
        }
        if !self.schedule.is_slot_start(key.time) {
            return Err(BackendError::OutsideSchedule { slot_key: *key });
        }
        if key.date == today && key.time <= self.clock.time_of_day() {
            return Err(BackendError::Unavailable {
                reason: UnavailableReason::PastDate,
            });
        }
        Ok(())
    }

    fn suggestions(&self, state: &ScopeState, contended: SlotTime, client: Option<ClientId>, now: Ms) -> Vec<SlotTime> {
        suggest_alternatives(
            &self.schedule,
            state,
            contended,
            client,
            self.clock.today(),
            self.clock.time_of_day(),
            now,
            MAX_SUGGESTIONS,
        )
    }

    /// External cancellation. The only way a booked time becomes free again.
    pub async fn cancel_booking(&self, appointment_id: AppointmentId) -> Result<SlotKey, BackendError> {
        let (_, key) = self
            .appointments
            .remove(&appointment_id)
            .ok_or(BackendError::AppointmentNotFound { appointment_id })?;
        let rs = self.scope_state(key.scope());
        let mut guard = rs.write().await;
        if guard.bookings.get(&key.time) == Some(&appointment_id) {
            guard.bookings.remove(&key.time);
        }
        self.idempotency.retain(|_, r| r.receipt.appointment_id != appointment_id);
        info!("cancelled appointment {appointment_id} at {key}");
        Ok(key)
    }

    /// Staff-side lock, reported in `locked_slots`.
    pub async fn block_time(&self, key: SlotKey) {
        let rs = self.scope_state(key.scope());
        rs.write().await.blocked.insert(key.time);
    }

    pub async fn unblock_time(&self, key: SlotKey) -> bool {
        let rs = self.scope_state(key.scope());
        rs.write().await.blocked.remove(&key.time)
    }

    /// Forget idempotency keys accepted more than `IDEMPOTENCY_RETENTION_MS` before `now`.
    pub fn evict_idempotency_keys(&self, now: Ms) -> usize {
        let before = self.idempotency.len();
        self.idempotency
            .retain(|_, r| now.saturating_sub(r.accepted_at) < IDEMPOTENCY_RETENTION_MS);
        let evicted = before.saturating_sub(self.idempotency.len());
        if evicted > 0 {
            debug!("evicted {evicted} idempotency keys");
        }
        evicted
    }

    pub fn idempotency_keys(&self) -> usize {
        self.idempotency.len()
    }

    /// Holds whose TTL has passed: `(scope, client)`.
    pub fn collect_expired_locks(&self, now: Ms) -> Vec<(Scope, ClientId)> {
        let mut expired = Vec::new();
        for entry in self.scopes.iter() {
            let rs = entry.value().clone();
            if let Ok(guard) = rs.try_read() {
                for (client, lock) in &guard.holds {
                    if !lock.is_live(now) {
                        expired.push((guard.scope, *client));
                    }
                }
            }
        }
        expired
    }

    /// Drop `client`'s hold in `scope` if it is still expired at `now`.
    pub async fn release_expired(&self, scope: Scope, client: ClientId, now: Ms) -> bool {
        let Some(rs) = self.scopes.get(&scope).map(|e| e.value().clone()) else {
            return false;
        };
        let mut guard = rs.write().await;
        match guard.holds.get(&client) {
            Some(lock) if !lock.is_live(now) => {
                guard.holds.remove(&client);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ReservationBackend for LocalBackend {
    async fn select_slot(&self, req: SelectRequest) -> Result<(), BackendError> {
        let key = req.slot_key;
        self.check_bookable(&key)?;
        let now = self.clock.now_ms();
        let rs = self.scope_state(key.scope());
        let mut guard = rs.write().await;

        if guard.is_taken(key.time, Some(req.client_id), None, now) {
            debug!("select rejected: {key} for {}", req.client_id);
            return Err(BackendError::SlotTaken {
                slot_key: key,
                suggested_slots: self.suggestions(&guard, key.time, Some(req.client_id), now),
            });
        }
        if guard.holds.len() >= MAX_SELECTIONS_PER_SCOPE && !guard.holds.contains_key(&req.client_id) {
            return Err(BackendError::LimitExceeded {
                message: "too many selections in scope".into(),
            });
        }

        guard.place(req.client_id, key.time, now, now + self.lock_ttl_ms);
        debug!("client {} holds {key}", req.client_id);
        Ok(())
    }

    async fn deselect_slot(&self, req: DeselectRequest) -> Result<(), BackendError> {
        let key = req.slot_key;
        let Some(rs) = self.scopes.get(&key.scope()).map(|e| e.value().clone()) else {
            return Ok(());
        };
        let mut guard = rs.write().await;
        match req.client_id {
            Some(client) => {
                if guard.holds.get(&client).is_some_and(|l| l.time == key.time) {
                    guard.holds.remove(&client);
                }
            }
            None => guard.holds.retain(|_, lock| lock.time != key.time),
        }
        Ok(())
    }

    async fn poll(&self, req: PollRequest) -> Result<PollResponse, BackendError> {
        let now = self.clock.now_ms();
        let rs = self.scope_state(req.scope);

        // Polling with the selected time keeps the caller's hold alive.
        if let (Some(client), Some(time)) = (req.client_id, req.selected_time) {
            let mut guard = rs.write().await;
            if let Some(lock) = guard.holds.get_mut(&client)
                && lock.time == time
                && lock.is_live(now)
            {
                lock.expires_at = now + self.lock_ttl_ms;
            }
        }

        let guard = rs.read().await;
        let closed_reason = day_closed_reason(&self.schedule, req.scope.date, self.clock.today());
        let booked_slots = if closed_reason.is_some() {
            SlotSet::All
        } else {
            guard
                .bookings
                .iter()
                .filter(|(_, id)| Some(**id) != req.exclude_appointment_id)
                .map(|(time, _)| *time)
                .collect()
        };

        let mut active_selections: Vec<SlotTime> = guard
            .holds
            .iter()
            .filter(|(client, lock)| lock.is_live(now) && Some(**client) != req.client_id)
            .map(|(_, lock)| lock.time)
            .collect();
        active_selections.sort();
        active_selections.dedup();

        let own_selection = req
            .client_id
            .and_then(|c| guard.holds.get(&c))
            .filter(|lock| lock.is_live(now))
            .map(|lock| OwnSelection {
                time: lock.time,
                expires_at: lock.expires_at,
            });

        Ok(ReservationSnapshot {
            scope: req.scope,
            booked_slots,
            active_selections,
            locked_slots: guard.blocked.iter().copied().collect(),
            own_selection,
            closed_reason,
            as_of: self.next_seq(),
            server_time: now,
        })
    }

    async fn create_booking(&self, req: BookingRequest) -> Result<BookingReceipt, BackendError> {
        if req.customer.name.trim().is_empty() || req.customer.email.trim().is_empty() {
            return Err(BackendError::invalid("customer name and email are required"));
        }
        let too_long = [Some(&req.customer.name), Some(&req.customer.email), req.customer.phone.as_ref(), req.customer.notes.as_ref()]
            .into_iter()
            .flatten()
            .any(|f| f.len() > MAX_CUSTOMER_FIELD_LEN);
        if too_long {
            return Err(BackendError::LimitExceeded {
                message: "customer field too long".into(),
            });
        }

        let key = req.slot_key;
        let rs = self.scope_state(key.scope());
        let mut guard = rs.write().await;

        // A replay of an accepted intent gets the original receipt, even if the
        // slot has since become unbookable.
        if let Some(r) = self.idempotency.get(&req.idempotency_key) {
            metrics::counter!(crate::observability::IDEMPOTENT_REPLAYS_TOTAL).increment(1);
            debug!("idempotent replay {} -> {}", req.idempotency_key, r.receipt.appointment_id);
            return Ok(r.receipt);
        }

        self.check_bookable(&key)?;
        let now = self.clock.now_ms();
        if guard.is_taken(key.time, req.client_id, None, now) {
            let suggested_slots = self.suggestions(&guard, key.time, req.client_id, now);
            info!("booking rejected, slot taken: {key}");
            return Err(BackendError::SlotTaken {
                slot_key: key,
                suggested_slots,
            });
        }
        if self.idempotency.len() >= MAX_IDEMPOTENCY_KEYS && self.evict_idempotency_keys(now) == 0 {
            return Err(BackendError::LimitExceeded {
                message: "too many idempotency keys".into(),
            });
        }

        let appointment_id = AppointmentId(self.next_appointment.fetch_add(1, Ordering::SeqCst));
        guard.bookings.insert(key.time, appointment_id);
        if let Some(client) = req.client_id {
            guard.holds.remove(&client);
        }
        let receipt = BookingReceipt {
            appointment_id,
            slot_key: key,
        };
        self.appointments.insert(appointment_id, key);
        self.idempotency.insert(
            req.idempotency_key,
            Remembered {
                receipt,
                accepted_at: now,
            },
        );
        info!("booked {key} as appointment {appointment_id}");
        Ok(receipt)
    }

    async fn availability_precheck(&self, req: PrecheckRequest) -> Result<Precheck, BackendError> {
        let today = self.clock.today();
        if let Some(reason) = day_closed_reason(&self.schedule, req.scope.date, today) {
            return Ok(Precheck {
                unavailable: SlotSet::All,
                booking_details: Vec::new(),
                reason: Some(reason),
            });
        }

        let rs = self.scope_state(req.scope);
        let guard = rs.read().await;
        let booking_details: Vec<BookingDetail> = guard
            .bookings
            .iter()
            .filter(|(_, id)| Some(**id) != req.exclude_appointment_id)
            .map(|(time, id)| BookingDetail {
                time: *time,
                appointment_id: *id,
            })
            .collect();

        let mut unavailable: BTreeSet<SlotTime> = booking_details.iter().map(|b| b.time).collect();
        unavailable.extend(guard.blocked.iter().copied());
        if req.scope.date == today {
            let now_tod = self.clock.time_of_day();
            unavailable.extend(self.schedule.slot_times().into_iter().filter(|t| *t <= now_tod));
        }

        Ok(Precheck {
            unavailable: SlotSet::Times(unavailable),
            booking_details,
            reason: None,
        })
    }
}
