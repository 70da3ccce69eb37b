mod connection;
mod heartbeat;

pub use connection::ConnectionManager;
pub use heartbeat::HeartbeatTransport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{BackendError, ReservationBackend};
use crate::config::{Config, TransportKind};
use crate::model::ReservationSnapshot;
use crate::wire::{ClientAction, PollRequest};

/// Periodic snapshot source plus the channel for outgoing client actions.
///
/// Consumers never assume a cadence or whether actions travel alone or ride on
/// the next tick; both resolve only once the server has answered.
#[async_trait]
pub trait PollingTransport: Send + Sync {
    async fn fetch(&self, req: PollRequest) -> Result<ReservationSnapshot, BackendError>;

    async fn send(&self, action: ClientAction) -> Result<(), BackendError>;

    fn cadence(&self) -> Duration;

    fn name(&self) -> &'static str;
}

/// Build the transport named by the config.
pub fn from_config(backend: Arc<dyn ReservationBackend>, config: &Config) -> Arc<dyn PollingTransport> {
    match config.transport {
        TransportKind::Interval => Arc::new(DirectPoller::new(
            backend,
            config.poll_interval,
            config.request_timeout,
        )),
        TransportKind::Heartbeat => Arc::new(HeartbeatTransport::new(
            backend,
            config.heartbeat_interval,
            config.request_timeout,
        )),
    }
}

/// Fixed custom interval; every action is its own request.
pub struct DirectPoller {
    backend: Arc<dyn ReservationBackend>,
    cadence: Duration,
    timeout: Duration,
}

impl DirectPoller {
    pub fn new(backend: Arc<dyn ReservationBackend>, cadence: Duration, timeout: Duration) -> Self {
        Self {
            backend,
            cadence,
            timeout,
        }
    }
}

/// Apply the per-request deadline.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(BackendError::Timeout))
}

#[async_trait]
impl PollingTransport for DirectPoller {
    async fn fetch(&self, req: PollRequest) -> Result<ReservationSnapshot, BackendError> {
        with_timeout(self.timeout, self.backend.poll(req)).await
    }

    async fn send(&self, action: ClientAction) -> Result<(), BackendError> {
        match action {
            ClientAction::Select(req) => with_timeout(self.timeout, self.backend.select_slot(req)).await,
            ClientAction::Deselect(req) => with_timeout(self.timeout, self.backend.deselect_slot(req)).await,
        }
    }

    fn cadence(&self) -> Duration {
        self.cadence
    }

    fn name(&self) -> &'static str {
        "interval"
    }
}
