use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{PollingTransport, with_timeout};
use crate::backend::ReservationBackend;
use crate::config::Config;
use crate::model::{AppointmentId, ClientId, EmployeeId, Scope};
use crate::observability;
use crate::store::{SlotStore, SnapshotDisposition};
use crate::wire::{PollRequest, PrecheckRequest};

struct PollSession {
    scope: Scope,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the poll loop for one client: starts it when a full scope is set,
/// tears it down on scope change, and reports reachability through the store.
pub struct ConnectionManager {
    client_id: ClientId,
    transport: Arc<dyn PollingTransport>,
    backend: Arc<dyn ReservationBackend>,
    store: SlotStore,
    exclude_appointment_id: Option<AppointmentId>,
    request_timeout: std::time::Duration,
    session: Mutex<Option<PollSession>>,
}

impl ConnectionManager {
    pub fn new(
        client_id: ClientId,
        transport: Arc<dyn PollingTransport>,
        backend: Arc<dyn ReservationBackend>,
        store: SlotStore,
        config: &Config,
    ) -> Self {
        Self {
            client_id,
            transport,
            backend,
            store,
            exclude_appointment_id: None,
            request_timeout: config.request_timeout,
            session: Mutex::new(None),
        }
    }

    /// Rescheduling: the appointment being moved does not count as booked.
    pub fn excluding(mut self, appointment_id: AppointmentId) -> Self {
        self.exclude_appointment_id = Some(appointment_id);
        self
    }

    pub fn store(&self) -> &SlotStore {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn PollingTransport> {
        &self.transport
    }

    pub async fn scope(&self) -> Option<Scope> {
        self.session.lock().await.as_ref().map(|s| s.scope)
    }

    /// Point the client at a (date, employee). Any running loop is stopped
    /// first, so no response for the old scope can land after this returns.
    /// An incomplete scope leaves the client idle and disconnected.
    pub async fn set_scope(&self, date: Option<NaiveDate>, employee_id: Option<EmployeeId>) {
        let scope = Scope::from_parts(date, employee_id);
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref()
            && Some(current.scope) == scope
        {
            return;
        }

        if let Some(old) = session.take() {
            stop(old).await;
        }
        self.store.clear_slots(scope);

        let Some(scope) = scope else {
            self.store.set_connection_status(false);
            metrics::gauge!(observability::CONNECTED).set(0.0);
            debug!("client {} idle, scope incomplete", self.client_id);
            return;
        };

        self.precheck(scope).await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_poll_loop(
            self.transport.clone(),
            self.store.clone(),
            scope,
            self.client_id,
            self.exclude_appointment_id,
            cancel.clone(),
        ));
        info!(
            "client {} polling {scope} via {} every {:?}",
            self.client_id,
            self.transport.name(),
            self.transport.cadence()
        );
        *session = Some(PollSession { scope, cancel, handle });
    }

    /// Day-level check before the first poll so closed days render at once.
    async fn precheck(&self, scope: Scope) {
        let req = PrecheckRequest {
            scope,
            exclude_appointment_id: self.exclude_appointment_id,
        };
        match with_timeout(self.request_timeout, self.backend.availability_precheck(req)).await {
            Ok(precheck) => {
                if let Some(reason) = precheck.reason {
                    info!("{scope} closed: {reason}");
                }
                self.store.set_closed_reason(precheck.reason);
            }
            Err(e) => warn!("availability precheck for {scope} failed: {e}"),
        }
    }

    /// Stop polling and mark the client disconnected.
    pub async fn shutdown(&self) {
        if let Some(old) = self.session.lock().await.take() {
            stop(old).await;
        }
        self.store.set_connection_status(false);
        metrics::gauge!(observability::CONNECTED).set(0.0);
    }
}

async fn stop(session: PollSession) {
    session.cancel.cancel();
    if let Err(e) = session.handle.await {
        warn!("poll loop for {} ended abnormally: {e}", session.scope);
    }
}

/// One request in flight at a time; ticks that fall due while it is
/// outstanding are skipped rather than queued.
async fn run_poll_loop(
    transport: Arc<dyn PollingTransport>,
    store: SlotStore,
    scope: Scope,
    client_id: ClientId,
    exclude_appointment_id: Option<AppointmentId>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(transport.cadence());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let req = PollRequest {
            scope,
            client_id: Some(client_id),
            selected_time: store.state().held_time(client_id),
            exclude_appointment_id,
        };
        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = transport.fetch(req) => result,
        };
        metrics::histogram!(observability::POLL_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match result {
            Ok(snap) => {
                metrics::counter!(observability::POLLS_TOTAL, "result" => "ok").increment(1);
                if store.set_connection_status(true) {
                    info!("client {client_id} connected to {scope}");
                    metrics::gauge!(observability::CONNECTED).set(1.0);
                }
                match store.apply_snapshot(&snap) {
                    SnapshotDisposition::Applied { .. } => {}
                    SnapshotDisposition::Stale => {
                        metrics::counter!(observability::SNAPSHOTS_DISCARDED_TOTAL, "reason" => "stale")
                            .increment(1);
                    }
                    SnapshotDisposition::WrongScope => {
                        metrics::counter!(observability::SNAPSHOTS_DISCARDED_TOTAL, "reason" => "scope")
                            .increment(1);
                    }
                }
            }
            Err(e) => {
                metrics::counter!(observability::POLLS_TOTAL, "result" => "error").increment(1);
                if store.set_connection_status(false) {
                    warn!("client {client_id} lost connection to {scope}: {e}");
                    metrics::gauge!(observability::CONNECTED).set(0.0);
                } else {
                    debug!("poll for {scope} failed again: {e}");
                }
            }
        }
        store.expire_pending();
    }
    debug!("poll loop for {scope} stopped");
}
