use crate::model::Ms;

/// Default soft-lock TTL (10 minutes).
pub const DEFAULT_LOCK_TTL_MS: Ms = 600_000;

/// Below this much remaining TTL the lock countdown turns urgent.
pub const DEFAULT_URGENT_THRESHOLD_MS: Ms = 120_000;

/// Upper bound for any configured duration (one day).
pub const MAX_CONFIG_DURATION_MS: Ms = 86_400_000;

/// Host-bound heartbeat ticks are clamped into this window.
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
pub const MAX_HEARTBEAT_INTERVAL_MS: u64 = 15_000;

/// Alternatives offered with a `slot_taken` rejection.
pub const MAX_SUGGESTIONS: usize = 3;

/// Concurrent soft locks accepted per scope (one per client).
pub const MAX_SELECTIONS_PER_SCOPE: usize = 1_000;

/// Remembered idempotency keys; new bookings are refused past this once
/// stale keys have been evicted.
pub const MAX_IDEMPOTENCY_KEYS: usize = 100_000;

/// How long an accepted booking answers replays of its key.
pub const IDEMPOTENCY_RETENTION_MS: Ms = 86_400_000;

/// Actions queued for one heartbeat tick.
pub const MAX_PIGGYBACK_ACTIONS: usize = 64;

pub const MAX_CUSTOMER_FIELD_LEN: usize = 1_024;
