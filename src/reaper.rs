use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::LocalBackend;

/// Background task that periodically removes expired soft locks and stale
/// idempotency keys.
///
/// Snapshots never report expired holds even before they are reaped; this only
/// keeps per-scope state from growing.
pub async fn run_reaper(backend: Arc<LocalBackend>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => break,
        }
        reap_once(&backend).await;
    }
}

/// One sweep. Returns how many holds were removed.
pub async fn reap_once(backend: &LocalBackend) -> usize {
    let now = backend.clock().now_ms();
    let mut reaped = 0;
    for (scope, client) in backend.collect_expired_locks(now) {
        // may have been renewed or released since collection
        if backend.release_expired(scope, client, now).await {
            info!("reaped expired soft lock of {client} in {scope}");
            reaped += 1;
        } else {
            tracing::debug!("reaper skip {client} in {scope}");
        }
    }
    if reaped > 0 {
        metrics::counter!(crate::observability::LOCKS_REAPED_TOTAL).increment(reaped as u64);
    }
    backend.evict_idempotency_keys(now);
    reaped
}
