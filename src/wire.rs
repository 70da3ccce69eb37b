//! JSON contract between the booking client and the reservation backend.
//!
//! Discrete requests use these types directly. The heartbeat transport nests
//! them under [`HEARTBEAT_NAMESPACE`] inside the host's shared tick payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::{BackendError, ReservationBackend};
use crate::model::*;

/// Payload key owned by this subsystem inside a multiplexed heartbeat.
pub const HEARTBEAT_NAMESPACE: &str = "slotsync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRequest {
    #[serde(flatten)]
    pub scope: Scope,
    #[serde(default)]
    pub client_id: Option<ClientId>,
    /// Renews the caller's soft lock when it still matches.
    #[serde(default)]
    pub selected_time: Option<SlotTime>,
    /// Rescheduling: the appointment being moved does not block its own time.
    #[serde(default)]
    pub exclude_appointment_id: Option<AppointmentId>,
}

impl PollRequest {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            client_id: None,
            selected_time: None,
            exclude_appointment_id: None,
        }
    }
}

pub type PollResponse = ReservationSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectRequest {
    #[serde(flatten)]
    pub slot_key: SlotKey,
    pub client_id: ClientId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeselectRequest {
    #[serde(flatten)]
    pub slot_key: SlotKey,
    /// When present only that client's hold is released.
    #[serde(default)]
    pub client_id: Option<ClientId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub service_id: u64,
    #[serde(flatten)]
    pub slot_key: SlotKey,
    pub customer: Customer,
    #[serde(default)]
    pub client_id: Option<ClientId>,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingReceipt {
    pub appointment_id: AppointmentId,
    pub slot_key: SlotKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecheckRequest {
    #[serde(flatten)]
    pub scope: Scope,
    #[serde(default)]
    pub exclude_appointment_id: Option<AppointmentId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDetail {
    pub time: SlotTime,
    pub appointment_id: AppointmentId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precheck {
    pub unavailable: SlotSet,
    pub booking_details: Vec<BookingDetail>,
    #[serde(default)]
    pub reason: Option<UnavailableReason>,
}

/// Outgoing client action, sent discretely or piggybacked on a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    Select(SelectRequest),
    Deselect(DeselectRequest),
}

impl ClientAction {
    pub fn slot_key(&self) -> SlotKey {
        match self {
            ClientAction::Select(r) => r.slot_key,
            ClientAction::Deselect(r) => r.slot_key,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub poll: Option<PollRequest>,
    #[serde(default)]
    pub actions: Vec<ClientAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<BackendError>,
}

impl From<Result<(), BackendError>> for ActionResult {
    fn from(r: Result<(), BackendError>) -> Self {
        match r {
            Ok(()) => ActionResult { ok: true, error: None },
            Err(e) => ActionResult {
                ok: false,
                error: Some(e),
            },
        }
    }
}

impl ActionResult {
    pub fn into_result(self) -> Result<(), BackendError> {
        match (self.ok, self.error) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(BackendError::network("action failed without error")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub snapshot: Option<ReservationSnapshot>,
    /// One entry per request action, same order.
    #[serde(default)]
    pub action_results: Vec<ActionResult>,
    /// Set when the poll part of the tick failed.
    #[serde(default)]
    pub poll_error: Option<BackendError>,
}

/// Wrap a request under the namespace key of a heartbeat payload.
pub fn encode_heartbeat<T: Serialize>(body: &T) -> Result<Value, BackendError> {
    let mut map = Map::new();
    map.insert(HEARTBEAT_NAMESPACE.to_string(), serde_json::to_value(body)?);
    Ok(Value::Object(map))
}

/// Pull this subsystem's part out of a heartbeat payload. `None` if absent.
pub fn decode_heartbeat<T: DeserializeOwned>(payload: &Value) -> Result<Option<T>, BackendError> {
    match payload.get(HEARTBEAT_NAMESPACE) {
        Some(body) => Ok(Some(serde_json::from_value(body.clone())?)),
        None => Ok(None),
    }
}

/// Serve one heartbeat tick against any backend: actions first (in order), then
/// the poll, so the returned snapshot already reflects the piggybacked actions.
pub async fn dispatch_heartbeat<B: ReservationBackend + ?Sized>(
    backend: &B,
    payload: Value,
) -> Result<Value, BackendError> {
    let Some(request) = decode_heartbeat::<HeartbeatRequest>(&payload)? else {
        return Ok(Value::Object(Map::new()));
    };
    if request.actions.len() > crate::limits::MAX_PIGGYBACK_ACTIONS {
        return Err(BackendError::LimitExceeded {
            message: "too many piggybacked actions".into(),
        });
    }

    let mut action_results = Vec::with_capacity(request.actions.len());
    for action in request.actions {
        let result = match action {
            ClientAction::Select(req) => backend.select_slot(req).await,
            ClientAction::Deselect(req) => backend.deselect_slot(req).await,
        };
        action_results.push(ActionResult::from(result));
    }

    let (snapshot, poll_error) = match request.poll {
        Some(poll) => match backend.poll(poll).await {
            Ok(snapshot) => (Some(snapshot), None),
            Err(e) => (None, Some(e)),
        },
        None => (None, None),
    };

    encode_heartbeat(&HeartbeatResponse {
        snapshot,
        action_results,
        poll_error,
    })
}
