use serde::{Deserialize, Serialize};

use crate::model::{AppointmentId, SlotKey, SlotTime, UnavailableReason};

/// Every way a backend call can fail, as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum BackendError {
    /// 409: the slot is booked or held by someone else.
    SlotTaken {
        slot_key: SlotKey,
        #[serde(default)]
        suggested_slots: Vec<SlotTime>,
    },
    AppointmentNotFound { appointment_id: AppointmentId },
    Unavailable { reason: UnavailableReason },
    /// Slot is outside the working hours of that day.
    OutsideSchedule { slot_key: SlotKey },
    Invalid { message: String },
    LimitExceeded { message: String },
    /// Connection refused, 5xx, malformed response.
    Network { message: String },
    Timeout,
    /// The transport has been torn down.
    Shutdown,
}

impl BackendError {
    pub fn network(message: impl Into<String>) -> Self {
        BackendError::Network {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        BackendError::Invalid {
            message: message.into(),
        }
    }

    /// Transport-level failure (as opposed to a decision by the server).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BackendError::Network { .. } | BackendError::Timeout | BackendError::Shutdown
        )
    }

    pub fn is_slot_taken(&self) -> bool {
        matches!(self, BackendError::SlotTaken { .. })
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::SlotTaken {
                slot_key,
                suggested_slots,
            } => {
                write!(f, "slot taken: {slot_key}")?;
                if !suggested_slots.is_empty() {
                    let list: Vec<String> = suggested_slots.iter().map(|t| t.to_string()).collect();
                    write!(f, " (try {})", list.join(", "))?;
                }
                Ok(())
            }
            BackendError::AppointmentNotFound { appointment_id } => {
                write!(f, "appointment not found: {appointment_id}")
            }
            BackendError::Unavailable { reason } => write!(f, "day unavailable: {reason}"),
            BackendError::OutsideSchedule { slot_key } => {
                write!(f, "outside working hours: {slot_key}")
            }
            BackendError::Invalid { message } => write!(f, "invalid request: {message}"),
            BackendError::LimitExceeded { message } => write!(f, "limit exceeded: {message}"),
            BackendError::Network { message } => write!(f, "network error: {message}"),
            BackendError::Timeout => write!(f, "request timed out"),
            BackendError::Shutdown => write!(f, "transport shut down"),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::network(format!("malformed payload: {e}"))
    }
}
