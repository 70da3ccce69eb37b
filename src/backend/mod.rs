mod error;
mod local;
mod schedule;

pub use error::BackendError;
pub use local::{LocalBackend, ScopeState, SharedScopeState, SoftLock};
pub use schedule::{Schedule, day_closed_reason, free_times, suggest_alternatives};

use async_trait::async_trait;
use serde_json::Value;

use crate::wire::*;

/// The reservation/persistence server as the client consumes it.
///
/// `select_slot` rejects with [`BackendError::SlotTaken`] (HTTP 409);
/// `deselect_slot` is best-effort; `poll` returns the authoritative snapshot.
#[async_trait]
pub trait ReservationBackend: Send + Sync {
    async fn select_slot(&self, req: SelectRequest) -> Result<(), BackendError>;

    async fn deselect_slot(&self, req: DeselectRequest) -> Result<(), BackendError>;

    async fn poll(&self, req: PollRequest) -> Result<PollResponse, BackendError>;

    async fn create_booking(&self, req: BookingRequest) -> Result<BookingReceipt, BackendError>;

    async fn availability_precheck(&self, req: PrecheckRequest) -> Result<Precheck, BackendError>;

    /// Host heartbeat tick carrying this subsystem's payload under its namespace key.
    async fn heartbeat(&self, payload: Value) -> Result<Value, BackendError> {
        dispatch_heartbeat(self, payload).await
    }
}
