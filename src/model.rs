use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

/// Time of day at minute resolution. Wire form is `"HH:MM"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotTime(u16);

impl SlotTime {
    pub const MINUTES_PER_DAY: u16 = 24 * 60;

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self(hour * 60 + minute))
        } else {
            None
        }
    }

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes < Self::MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    /// Absolute distance in minutes.
    pub fn distance(self, other: SlotTime) -> u16 {
        self.0.abs_diff(other.0)
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSlotTimeError(String);

impl fmt::Display for ParseSlotTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid slot time: {:?}", self.0)
    }
}

impl std::error::Error for ParseSlotTimeError {}

impl FromStr for SlotTime {
    type Err = ParseSlotTimeError;

    /// Accepts `HH:MM` and `HH:MM:SS` (seconds must be zero).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseSlotTimeError(s.to_string());
        let mut parts = s.trim().split(':');
        let hour: u16 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let minute: u16 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        if let Some(sec) = parts.next()
            && sec != "00"
        {
            return Err(err());
        }
        if parts.next().is_some() {
            return Err(err());
        }
        SlotTime::from_hm(hour, minute).ok_or_else(err)
    }
}

impl TryFrom<String> for SlotTime {
    type Error = ParseSlotTimeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SlotTime> for String {
    fn from(t: SlotTime) -> Self {
        t.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmployeeId(pub u64);

impl fmt::Display for EmployeeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppointmentId(pub u64);

impl fmt::Display for AppointmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one browser tab / booking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Ulid);

impl ClientId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque token the server uses to dedupe replays of one booking intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(pub Ulid);

impl IdempotencyKey {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(date, employee)`: bounds one polling/watching session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub date: NaiveDate,
    pub employee_id: EmployeeId,
}

impl Scope {
    pub fn new(date: NaiveDate, employee_id: EmployeeId) -> Self {
        Self { date, employee_id }
    }

    /// Complete scope only when both parts are known.
    pub fn from_parts(date: Option<NaiveDate>, employee_id: Option<EmployeeId>) -> Option<Self> {
        Some(Self::new(date?, employee_id?))
    }

    pub fn slot(&self, time: SlotTime) -> SlotKey {
        SlotKey {
            date: self.date,
            employee_id: self.employee_id,
            time,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.date, self.employee_id)
    }
}

/// One bookable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub employee_id: EmployeeId,
    pub time: SlotTime,
}

impl SlotKey {
    pub fn scope(&self) -> Scope {
        Scope::new(self.date, self.employee_id)
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.date, self.time, self.employee_id)
    }
}

/// A set of times, or the day-level `All` sentinel for a closed day.
///
/// Wire form is either the string `"all"` or an array of `"HH:MM"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotSet {
    All,
    Times(BTreeSet<SlotTime>),
}

impl Default for SlotSet {
    fn default() -> Self {
        SlotSet::Times(BTreeSet::new())
    }
}

impl SlotSet {
    pub fn contains(&self, time: SlotTime) -> bool {
        match self {
            SlotSet::All => true,
            SlotSet::Times(times) => times.contains(&time),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, SlotSet::All)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, SlotSet::Times(t) if t.is_empty())
    }
}

impl FromIterator<SlotTime> for SlotSet {
    fn from_iter<I: IntoIterator<Item = SlotTime>>(iter: I) -> Self {
        SlotSet::Times(iter.into_iter().collect())
    }
}

impl Serialize for SlotSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SlotSet::All => serializer.serialize_str("all"),
            SlotSet::Times(times) => serializer.collect_seq(times),
        }
    }
}

impl<'de> Deserialize<'de> for SlotSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Word(String),
            Times(Vec<SlotTime>),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Word(w) if w == "all" => Ok(SlotSet::All),
            Repr::Word(w) => Err(serde::de::Error::custom(format!(
                "expected \"all\" or a list of times, got {w:?}"
            ))),
            Repr::Times(times) => Ok(SlotSet::Times(times.into_iter().collect())),
        }
    }
}

/// Reconciled status of one time in the current scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotStatus {
    Available,
    /// Softly held. `client_id` is only known for the caller's own hold.
    SoftLocked {
        client_id: Option<ClientId>,
        expires_at: Option<Ms>,
    },
    /// Staff-side lock (break, manual block).
    Locked,
    Booked {
        appointment_id: Option<AppointmentId>,
    },
    /// Whole day closed.
    AllUnavailable,
}

impl SlotStatus {
    pub fn is_selectable(&self) -> bool {
        matches!(self, SlotStatus::Available)
    }
}

/// Why a whole day cannot be booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    NonWorkingDay,
    BlackoutDate,
    TooFarAdvance,
    PastDate,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnavailableReason::NonWorkingDay => "non_working_day",
            UnavailableReason::BlackoutDate => "blackout_date",
            UnavailableReason::TooFarAdvance => "too_far_advance",
            UnavailableReason::PastDate => "past_date",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSelection {
    pub client_id: ClientId,
    pub slot_key: SlotKey,
    pub selected_at: Ms,
}

/// The caller's own live soft lock as echoed back by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnSelection {
    pub time: SlotTime,
    pub expires_at: Ms,
}

/// Authoritative periodic payload for one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSnapshot {
    pub scope: Scope,
    pub booked_slots: SlotSet,
    /// Times softly held by other clients ("being booked").
    pub active_selections: Vec<SlotTime>,
    /// Staff-side locks.
    pub locked_slots: Vec<SlotTime>,
    #[serde(default)]
    pub own_selection: Option<OwnSelection>,
    #[serde(default)]
    pub closed_reason: Option<UnavailableReason>,
    /// Strictly increasing per server; older snapshots are discarded.
    pub as_of: u64,
    pub server_time: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Rejected at booking submission.
    SlotTaken,
    /// Observed through a snapshot.
    SlotConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEvent {
    pub slot_key: SlotKey,
    pub detected_at: Ms,
    pub kind: ConflictKind,
}
