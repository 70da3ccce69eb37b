//! Per-client reconciled slot state.
//!
//! Two tiers: the confirmed layer (last accepted snapshot) and a pending overlay
//! of the client's own optimistic edits keyed by (client, slot). Readers get the
//! merged picture from [`SlotState::status`]; subscribers are woken only when
//! something they could render actually changed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::clock::Clock;
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingEdit {
    Select,
    Deselect,
}

/// A local edit not yet confirmed by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    pub edit: PendingEdit,
    pub since: Ms,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotState {
    pub scope: Option<Scope>,
    pub booked_slots: SlotSet,
    pub active_selections: BTreeSet<SlotTime>,
    pub locked_slots: BTreeSet<SlotTime>,
    pub own_selection: Option<OwnSelection>,
    pub closed_reason: Option<UnavailableReason>,
    pub is_connected: bool,
    /// Bumped on every visible change.
    pub revision: u64,
    pub last_update: Option<Ms>,
    /// Sequence of the applied snapshot; `None` until one is accepted.
    pub as_of: Option<u64>,
    pub pending: BTreeMap<(ClientId, SlotKey), Pending>,
}

/// Partial replacement of the confirmed sets. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotDataUpdate {
    pub booked_slots: Option<SlotSet>,
    pub active_selections: Option<Vec<SlotTime>>,
    pub locked_slots: Option<Vec<SlotTime>>,
}

impl From<&ReservationSnapshot> for SlotDataUpdate {
    fn from(snap: &ReservationSnapshot) -> Self {
        Self {
            booked_slots: Some(snap.booked_slots.clone()),
            active_selections: Some(snap.active_selections.clone()),
            locked_slots: Some(snap.locked_slots.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotDisposition {
    Applied { changed: bool },
    /// Not newer than the applied snapshot.
    Stale,
    /// For a scope the store is no longer showing.
    WrongScope,
}

impl SlotState {
    fn pending_is_live(p: &Pending, now: Ms, shadow_ms: Ms) -> bool {
        now - p.since < shadow_ms
    }

    /// Merged status of `time` as seen by `viewer`.
    ///
    /// Booked always wins; the viewer's live pending edits override its own
    /// hold as last reported; other clients' holds show as soft-locked.
    pub fn status(&self, time: SlotTime, viewer: Option<ClientId>, now: Ms, shadow_ms: Ms) -> SlotStatus {
        if self.booked_slots.is_all() || self.closed_reason.is_some() {
            return SlotStatus::AllUnavailable;
        }
        if self.booked_slots.contains(time) {
            return SlotStatus::Booked { appointment_id: None };
        }
        if self.locked_slots.contains(&time) {
            return SlotStatus::Locked;
        }

        let mut own_hold = self.own_selection.filter(|o| o.time == time);
        if let (Some(viewer), Some(scope)) = (viewer, self.scope) {
            let live = |key: SlotKey| {
                self.pending
                    .get(&(viewer, key))
                    .filter(|p| Self::pending_is_live(p, now, shadow_ms))
                    .map(|p| p.edit)
            };
            match live(scope.slot(time)) {
                Some(PendingEdit::Select) => {
                    return SlotStatus::SoftLocked {
                        client_id: Some(viewer),
                        expires_at: own_hold.map(|o| o.expires_at),
                    };
                }
                Some(PendingEdit::Deselect) => own_hold = None,
                None => {}
            }
            // Selecting elsewhere releases this one.
            let moved_away = self.pending.iter().any(|((c, k), p)| {
                *c == viewer
                    && k.scope() == scope
                    && k.time != time
                    && p.edit == PendingEdit::Select
                    && Self::pending_is_live(p, now, shadow_ms)
            });
            if moved_away {
                own_hold = None;
            }
        }

        if let Some(own) = own_hold {
            return SlotStatus::SoftLocked {
                client_id: viewer,
                expires_at: Some(own.expires_at),
            };
        }
        if self.active_selections.contains(&time) {
            return SlotStatus::SoftLocked {
                client_id: None,
                expires_at: None,
            };
        }
        SlotStatus::Available
    }

    /// The time `client` currently claims in this scope: its newest pending
    /// select, else the hold the server last reported. Sent with each poll so
    /// the server keeps renewing it.
    pub fn held_time(&self, client: ClientId) -> Option<SlotTime> {
        let scope = self.scope?;
        let newest_select = self
            .pending
            .iter()
            .filter(|((c, k), p)| *c == client && k.scope() == scope && p.edit == PendingEdit::Select)
            .max_by_key(|(_, p)| p.since)
            .map(|((_, k), _)| k.time);
        if newest_select.is_some() {
            return newest_select;
        }
        self.own_selection.map(|o| o.time).filter(|&time| {
            !matches!(
                self.pending.get(&(client, scope.slot(time))),
                Some(Pending { edit: PendingEdit::Deselect, .. })
            )
        })
    }

    fn touch(&mut self, now: Ms) {
        self.revision += 1;
        self.last_update = Some(now);
    }

    /// Order-independent diff of each supplied set; replaces only what changed.
    fn merge_slot_data(&mut self, update: SlotDataUpdate) -> bool {
        let mut changed = false;
        if let Some(booked) = update.booked_slots
            && booked != self.booked_slots
        {
            self.booked_slots = booked;
            changed = true;
        }
        if let Some(active) = update.active_selections {
            let active: BTreeSet<SlotTime> = active.into_iter().collect();
            if active != self.active_selections {
                self.active_selections = active;
                changed = true;
            }
        }
        if let Some(locked) = update.locked_slots {
            let locked: BTreeSet<SlotTime> = locked.into_iter().collect();
            if locked != self.locked_slots {
                self.locked_slots = locked;
                changed = true;
            }
        }
        changed
    }

    /// Drop overlay entries the snapshot confirms, contradicts with a booking,
    /// or that have outlived the shadow window.
    fn prune_pending(&mut self, snap: Option<&ReservationSnapshot>, now: Ms, shadow_ms: Ms) -> bool {
        let before = self.pending.len();
        let booked = self.booked_slots.clone();
        self.pending.retain(|(_, key), p| {
            if !Self::pending_is_live(p, now, shadow_ms) {
                return false;
            }
            let Some(snap) = snap.filter(|s| s.scope == key.scope()) else {
                return true;
            };
            let held = snap.own_selection.map(|o| o.time);
            match p.edit {
                PendingEdit::Select => held != Some(key.time) && !booked.contains(key.time),
                PendingEdit::Deselect => held == Some(key.time),
            }
        });
        self.pending.len() != before
    }
}

/// Single mutable slot structure of one client, mutated only through its
/// reducer actions. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SlotStore {
    tx: Arc<watch::Sender<SlotState>>,
    clock: Clock,
    shadow_ms: Ms,
}

impl SlotStore {
    pub fn new(clock: Clock, shadow_ms: Ms) -> Self {
        let (tx, _) = watch::channel(SlotState::default());
        Self {
            tx: Arc::new(tx),
            clock,
            shadow_ms,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SlotState> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> SlotState {
        self.tx.borrow().clone()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn scope(&self) -> Option<Scope> {
        self.tx.borrow().scope
    }

    pub fn booked_slots(&self) -> SlotSet {
        self.tx.borrow().booked_slots.clone()
    }

    pub fn active_selections(&self) -> BTreeSet<SlotTime> {
        self.tx.borrow().active_selections.clone()
    }

    pub fn locked_slots(&self) -> BTreeSet<SlotTime> {
        self.tx.borrow().locked_slots.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.tx.borrow().is_connected
    }

    pub fn last_update(&self) -> Option<Ms> {
        self.tx.borrow().last_update
    }

    pub fn revision(&self) -> u64 {
        self.tx.borrow().revision
    }

    pub fn status(&self, time: SlotTime, viewer: Option<ClientId>) -> SlotStatus {
        self.tx
            .borrow()
            .status(time, viewer, self.clock.now_ms(), self.shadow_ms)
    }

    /// Replace whichever sets differ; bump `last_update` only on a real change.
    pub fn update_slot_data(&self, update: SlotDataUpdate) -> bool {
        let now = self.clock.now_ms();
        self.tx.send_if_modified(|state| {
            let changed = state.merge_slot_data(update);
            if changed {
                state.touch(now);
            }
            changed
        })
    }

    pub fn set_connection_status(&self, connected: bool) -> bool {
        let now = self.clock.now_ms();
        self.tx.send_if_modified(|state| {
            if state.is_connected == connected {
                return false;
            }
            state.is_connected = connected;
            state.touch(now);
            true
        })
    }

    /// Reset for a new scope (or none). Connection status is kept.
    pub fn clear_slots(&self, scope: Option<Scope>) {
        let now = self.clock.now_ms();
        self.tx.send_modify(|state| {
            *state = SlotState {
                scope,
                is_connected: state.is_connected,
                revision: state.revision,
                last_update: state.last_update,
                ..SlotState::default()
            };
            state.touch(now);
        });
    }

    /// Accept a snapshot if it is for the current scope and newer than the
    /// applied one.
    pub fn apply_snapshot(&self, snap: &ReservationSnapshot) -> SnapshotDisposition {
        let now = self.clock.now_ms();
        let shadow_ms = self.shadow_ms;
        let mut disposition = SnapshotDisposition::WrongScope;
        self.tx.send_if_modified(|state| {
            if state.scope != Some(snap.scope) {
                return false;
            }
            if state.as_of.is_some_and(|applied| snap.as_of <= applied) {
                disposition = SnapshotDisposition::Stale;
                return false;
            }
            state.as_of = Some(snap.as_of);

            let mut changed = state.merge_slot_data(SlotDataUpdate::from(snap));
            if state.own_selection != snap.own_selection {
                state.own_selection = snap.own_selection;
                changed = true;
            }
            if state.closed_reason != snap.closed_reason {
                state.closed_reason = snap.closed_reason;
                changed = true;
            }
            changed |= state.prune_pending(Some(snap), now, shadow_ms);
            if changed {
                state.touch(now);
            }
            disposition = SnapshotDisposition::Applied { changed };
            changed
        });
        if disposition != (SnapshotDisposition::Applied { changed: true }) {
            debug!("snapshot {} for {}: {disposition:?}", snap.as_of, snap.scope);
        }
        disposition
    }

    /// Record a day-level closure learned outside the poll (availability precheck).
    pub fn set_closed_reason(&self, reason: Option<UnavailableReason>) -> bool {
        let now = self.clock.now_ms();
        self.tx.send_if_modified(|state| {
            if state.closed_reason == reason {
                return false;
            }
            state.closed_reason = reason;
            state.touch(now);
            true
        })
    }

    /// Shadow the confirmed layer with a local edit. Ignored outside the current scope.
    pub fn mark_pending(&self, client: ClientId, key: SlotKey, edit: PendingEdit) -> bool {
        let now = self.clock.now_ms();
        self.tx.send_if_modified(|state| {
            if state.scope != Some(key.scope()) {
                return false;
            }
            state.pending.insert((client, key), Pending { edit, since: now });
            state.touch(now);
            true
        })
    }

    /// Withdraw a local edit (rollback).
    pub fn clear_pending(&self, client: ClientId, key: SlotKey) -> bool {
        let now = self.clock.now_ms();
        self.tx.send_if_modified(|state| {
            if state.pending.remove(&(client, key)).is_none() {
                return false;
            }
            state.touch(now);
            true
        })
    }

    /// Expire overlay entries past the shadow window.
    pub fn expire_pending(&self) -> bool {
        let now = self.clock.now_ms();
        let shadow_ms = self.shadow_ms;
        self.tx.send_if_modified(|state| {
            let changed = state.prune_pending(None, now, shadow_ms);
            if changed {
                state.touch(now);
            }
            changed
        })
    }
}
