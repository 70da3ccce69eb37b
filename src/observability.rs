use std::net::SocketAddr;

// ── Client-side metrics ─────────────────────────────────────────

/// Counter: poll requests issued. Labels: result (ok, error).
pub const POLLS_TOTAL: &str = "slotsync_polls_total";

/// Histogram: poll round-trip in seconds.
pub const POLL_DURATION_SECONDS: &str = "slotsync_poll_duration_seconds";

/// Counter: snapshots not applied. Labels: reason (stale, scope).
pub const SNAPSHOTS_DISCARDED_TOTAL: &str = "slotsync_snapshots_discarded_total";

/// Gauge: 1 while the poll loop reaches the backend.
pub const CONNECTED: &str = "slotsync_connected";

/// Counter: select attempts. Labels: result (selected, ignored, rejected, error).
pub const SELECT_TOTAL: &str = "slotsync_select_total";

/// Counter: conflicts surfaced to the UI. Labels: kind.
pub const CONFLICTS_TOTAL: &str = "slotsync_conflicts_total";

/// Counter: booking submissions. Labels: result (success, conflict, error).
pub const BOOKINGS_TOTAL: &str = "slotsync_bookings_total";

// ── Backend metrics ─────────────────────────────────────────────

/// Counter: expired soft locks removed by the reaper.
pub const LOCKS_REAPED_TOTAL: &str = "slotsync_locks_reaped_total";

/// Counter: booking replays answered from the idempotency cache.
pub const IDEMPOTENT_REPLAYS_TOTAL: &str = "slotsync_idempotent_replays_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a booking outcome to a short label for metrics.
pub fn booking_label(outcome: &crate::booking::BookingOutcome) -> &'static str {
    use crate::booking::BookingOutcome;
    match outcome {
        BookingOutcome::Success { .. } => "success",
        BookingOutcome::Conflict { .. } => "conflict",
        BookingOutcome::Failed(_) => "error",
    }
}
