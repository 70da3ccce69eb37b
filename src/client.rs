use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::backend::BackendError;
use crate::model::{ClientId, ClientSelection, SlotKey, SlotTime};
use crate::observability;
use crate::store::{PendingEdit, SlotStore};
use crate::transport::PollingTransport;
use crate::wire::{ClientAction, DeselectRequest, SelectRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOutcome {
    Selected,
    /// Already the current selection; nothing was sent.
    Unchanged,
    /// Another select is still waiting for its answer.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    /// Someone else holds or booked the slot.
    Rejected {
        slot_key: SlotKey,
        suggested: Vec<SlotTime>,
    },
    Transport(BackendError),
}

impl fmt::Display for SelectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectError::Rejected { slot_key, .. } => write!(f, "slot {slot_key} is being booked by someone else"),
            SelectError::Transport(e) => write!(f, "select failed: {e}"),
        }
    }
}

impl std::error::Error for SelectError {}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One visitor's side of the slot protocol: at most one held slot, at most
/// one select waiting for an answer.
pub struct ReservationClient {
    client_id: ClientId,
    transport: Arc<dyn PollingTransport>,
    store: SlotStore,
    in_flight: AtomicBool,
    current: Mutex<Option<ClientSelection>>,
}

impl ReservationClient {
    pub fn new(client_id: ClientId, transport: Arc<dyn PollingTransport>, store: SlotStore) -> Self {
        Self {
            client_id,
            transport,
            store,
            in_flight: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn store(&self) -> &SlotStore {
        &self.store
    }

    pub fn current_selection(&self) -> Option<ClientSelection> {
        *self.current()
    }

    pub fn is_selecting(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    // never held across an await
    fn current(&self) -> MutexGuard<'_, Option<ClientSelection>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn replace_current(&self, next: Option<ClientSelection>) -> Option<ClientSelection> {
        std::mem::replace(&mut *self.current(), next)
    }

    /// Claim `slot_key` for this client.
    ///
    /// The slot shows as ours immediately; a rejection rolls the view and the
    /// current selection back to what they were. On success the previous
    /// selection, if any, is released.
    pub async fn select_slot(&self, slot_key: SlotKey) -> Result<SelectOutcome, SelectError> {
        let Some(guard) = InFlight::acquire(&self.in_flight) else {
            debug!("client {} ignoring select of {slot_key}, one in flight", self.client_id);
            metrics::counter!(observability::SELECT_TOTAL, "result" => "ignored").increment(1);
            return Ok(SelectOutcome::Ignored);
        };
        if self.current().is_some_and(|c| c.slot_key == slot_key) {
            return Ok(SelectOutcome::Unchanged);
        }

        let selection = ClientSelection {
            client_id: self.client_id,
            slot_key,
            selected_at: self.store.clock().now_ms(),
        };
        let previous = self.replace_current(Some(selection));
        self.store.mark_pending(self.client_id, slot_key, PendingEdit::Select);

        let action = ClientAction::Select(SelectRequest {
            slot_key,
            client_id: self.client_id,
        });
        match self.transport.send(action).await {
            Ok(()) => {
                info!("client {} holds {slot_key}", self.client_id);
                metrics::counter!(observability::SELECT_TOTAL, "result" => "selected").increment(1);
                drop(guard);
                if let Some(prev) = previous
                    && prev.slot_key != slot_key
                {
                    // same-scope holds were already replaced by the server
                    self.release(prev.slot_key).await;
                }
                Ok(SelectOutcome::Selected)
            }
            Err(e) => {
                self.replace_current(previous);
                self.store.clear_pending(self.client_id, slot_key);
                match e {
                    BackendError::SlotTaken { suggested_slots, .. } => {
                        info!("client {} lost {slot_key} to another client", self.client_id);
                        metrics::counter!(observability::SELECT_TOTAL, "result" => "rejected").increment(1);
                        Err(SelectError::Rejected {
                            slot_key,
                            suggested: suggested_slots,
                        })
                    }
                    e => {
                        warn!("client {} select of {slot_key} failed: {e}", self.client_id);
                        metrics::counter!(observability::SELECT_TOTAL, "result" => "error").increment(1);
                        Err(SelectError::Transport(e))
                    }
                }
            }
        }
    }

    /// Release `slot_key`. Never fails: if the server cannot be told, the
    /// hold simply runs out.
    pub async fn deselect_slot(&self, slot_key: SlotKey) {
        {
            let mut current = self.current();
            if current.is_some_and(|c| c.slot_key == slot_key) {
                *current = None;
            }
        }
        self.store.mark_pending(self.client_id, slot_key, PendingEdit::Deselect);
        self.release(slot_key).await;
    }

    /// Teardown: release whatever is held.
    pub async fn leave(&self) {
        let held = self.replace_current(None);
        if let Some(selection) = held {
            self.store
                .mark_pending(self.client_id, selection.slot_key, PendingEdit::Deselect);
            self.release(selection.slot_key).await;
        }
    }

    /// The selection became a booking; there is nothing left to release.
    pub fn forget_selection(&self, slot_key: SlotKey) {
        {
            let mut current = self.current();
            if current.is_some_and(|c| c.slot_key == slot_key) {
                *current = None;
            }
        }
        self.store.clear_pending(self.client_id, slot_key);
    }

    async fn release(&self, slot_key: SlotKey) {
        let action = ClientAction::Deselect(DeselectRequest {
            slot_key,
            client_id: Some(self.client_id),
        });
        match self.transport.send(action).await {
            Ok(()) => debug!("client {} released {slot_key}", self.client_id),
            Err(e) => warn!("release of {slot_key} by {} failed, hold will expire: {e}", self.client_id),
        }
    }
}
