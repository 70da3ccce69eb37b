use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use super::{PollingTransport, with_timeout};
use crate::backend::{BackendError, ReservationBackend};
use crate::limits::MAX_PIGGYBACK_ACTIONS;
use crate::model::ReservationSnapshot;
use crate::wire::{
    ActionResult, ClientAction, HeartbeatRequest, HeartbeatResponse, PollRequest, decode_heartbeat,
    encode_heartbeat,
};

struct Queued {
    id: u64,
    action: ClientAction,
    tx: oneshot::Sender<Result<(), BackendError>>,
}

/// Rides the host's periodic heartbeat. Snapshot requests and queued client
/// actions travel together in one namespaced payload per tick.
pub struct HeartbeatTransport {
    backend: Arc<dyn ReservationBackend>,
    cadence: Duration,
    timeout: Duration,
    queue: Mutex<Vec<Queued>>,
    next_id: AtomicU64,
}

impl HeartbeatTransport {
    pub fn new(backend: Arc<dyn ReservationBackend>, cadence: Duration, timeout: Duration) -> Self {
        Self {
            backend,
            cadence,
            timeout,
            queue: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of actions waiting for the next tick.
    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    async fn enqueue(
        &self,
        action: ClientAction,
    ) -> Result<(u64, oneshot::Receiver<Result<(), BackendError>>), BackendError> {
        let mut queue = self.queue.lock().await;
        if queue.len() >= MAX_PIGGYBACK_ACTIONS {
            return Err(BackendError::LimitExceeded {
                message: format!("more than {MAX_PIGGYBACK_ACTIONS} actions waiting for the next heartbeat"),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        queue.push(Queued { id, action, tx });
        Ok((id, rx))
    }

    async fn withdraw(&self, id: u64) {
        self.queue.lock().await.retain(|q| q.id != id);
    }

    /// One heartbeat round trip: drain queued actions, attach the poll if any,
    /// and hand every waiter its own result.
    ///
    /// The exchange runs on its own task. A caller that stops waiting (the
    /// watched scope changed mid-tick) leaves the drained actions on the wire,
    /// and their waiters still get the server's answer.
    async fn tick(&self, poll: Option<PollRequest>) -> Result<Option<ReservationSnapshot>, BackendError> {
        let batch: Vec<Queued> = {
            let mut queue = self.queue.lock().await;
            let n = queue.len().min(MAX_PIGGYBACK_ACTIONS);
            queue.drain(..n).collect()
        };
        let (actions, waiters): (Vec<_>, Vec<_>) = batch.into_iter().map(|q| (q.action, q.tx)).unzip();
        if !actions.is_empty() {
            debug!("heartbeat carrying {} action(s)", actions.len());
        }

        let round_trip = tokio::spawn(exchange(
            self.backend.clone(),
            self.timeout,
            HeartbeatRequest { poll, actions },
            waiters,
        ));
        round_trip
            .await
            .unwrap_or_else(|e| Err(BackendError::network(format!("heartbeat task failed: {e}"))))
    }
}

async fn exchange(
    backend: Arc<dyn ReservationBackend>,
    timeout: Duration,
    request: HeartbeatRequest,
    waiters: Vec<oneshot::Sender<Result<(), BackendError>>>,
) -> Result<Option<ReservationSnapshot>, BackendError> {
    let result = match encode_heartbeat(&request) {
        Ok(payload) => with_timeout(timeout, backend.heartbeat(payload))
            .await
            .and_then(|reply| {
                decode_heartbeat::<HeartbeatResponse>(&reply)?
                    .ok_or_else(|| BackendError::network("heartbeat reply without reservation data"))
            }),
        Err(e) => Err(e),
    };

    match result {
        Err(e) => {
            for tx in waiters {
                let _ = tx.send(Err(e.clone()));
            }
            Err(e)
        }
        Ok(resp) => {
            let mut results = resp.action_results.into_iter();
            for tx in waiters {
                let result = results
                    .next()
                    .map(ActionResult::into_result)
                    .unwrap_or_else(|| Err(BackendError::network("heartbeat reply is missing an action result")));
                let _ = tx.send(result);
            }
            match resp.poll_error {
                Some(e) => Err(e),
                None => Ok(resp.snapshot),
            }
        }
    }
}

#[async_trait]
impl PollingTransport for HeartbeatTransport {
    async fn fetch(&self, req: PollRequest) -> Result<ReservationSnapshot, BackendError> {
        self.tick(Some(req))
            .await?
            .ok_or_else(|| BackendError::network("heartbeat reply without snapshot"))
    }

    /// Queue the action for the next tick and wait for its result. The host
    /// heartbeat keeps beating without a watched scope, so when no poll picks
    /// the action up within one cadence it is flushed on its own tick.
    async fn send(&self, action: ClientAction) -> Result<(), BackendError> {
        let (id, mut rx) = self.enqueue(action).await?;
        if let Ok(result) = tokio::time::timeout(self.cadence, &mut rx).await {
            return result.unwrap_or(Err(BackendError::Shutdown));
        }

        if let Err(e) = self.tick(None).await {
            warn!("action-only heartbeat failed: {e}");
        }
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(result) => result.unwrap_or(Err(BackendError::Shutdown)),
            Err(_) => {
                self.withdraw(id).await;
                Err(BackendError::Timeout)
            }
        }
    }

    fn cadence(&self) -> Duration {
        self.cadence
    }

    fn name(&self) -> &'static str {
        "heartbeat"
    }
}
