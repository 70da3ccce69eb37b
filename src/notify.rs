use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{ConflictEvent, Ms, Scope, SlotKey, SlotTime};

const CHANNEL_CAPACITY: usize = 64;

/// Everything published on the conflict bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictSignal {
    /// Our booking request for this slot is on its way. Until it resolves, the
    /// slot showing as booked may be our own doing.
    BookingStarted { slot_key: SlotKey },
    /// The booking request ended without a verdict on the slot (timeout,
    /// network, validation).
    BookingFailed { slot_key: SlotKey },
    /// Booking submission came back `slot_taken`. Published by the booking
    /// coordinator so the detector need not wait for the next poll.
    BookingRejected {
        slot_key: SlotKey,
        suggested: Vec<SlotTime>,
        at: Ms,
    },
    /// Our own booking went through. The detector stops treating that slot's
    /// booked state as a loss.
    BookingConfirmed { slot_key: SlotKey },
    /// A watched slot was lost to another party.
    ConflictDetected(ConflictEvent),
    /// Alternatives for the slot in conflict.
    SuggestedSlots {
        slot_key: SlotKey,
        alternatives: Vec<SlotTime>,
    },
    /// The detector no longer has a conflict to show.
    ConflictsCleared { scope: Scope },
}

/// Typed publish/subscribe hub of one visitor, one broadcast channel per scope.
/// Visitors never share a bus: every signal on it is about this visitor.
pub struct ConflictBus {
    channels: DashMap<Scope, broadcast::Sender<ConflictSignal>>,
}

impl Default for ConflictBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to signals for a scope. Creates the channel if needed.
    pub fn subscribe(&self, scope: Scope) -> broadcast::Receiver<ConflictSignal> {
        let sender = self
            .channels
            .entry(scope)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish a signal. No-op if nobody is listening.
    pub fn send(&self, scope: Scope, signal: ConflictSignal) {
        if let Some(sender) = self.channels.get(&scope) {
            let _ = sender.send(signal);
        }
    }

    /// Drop a scope's channel once its session is over.
    pub fn remove(&self, scope: &Scope) {
        self.channels.remove(scope);
    }
}
