use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate, Weekday};

use crate::model::*;

use super::local::ScopeState;

/// Working calendar of the reference backend.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub working_days: Vec<Weekday>,
    /// First bookable start time.
    pub opening: SlotTime,
    /// No slot may start at or after this.
    pub closing: SlotTime,
    pub slot_minutes: u16,
    pub blackout_dates: BTreeSet<NaiveDate>,
    pub max_advance_days: i64,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            working_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
            ],
            opening: SlotTime::from_minutes(9 * 60).unwrap_or_default(),
            closing: SlotTime::from_minutes(17 * 60).unwrap_or_default(),
            slot_minutes: 30,
            blackout_dates: BTreeSet::new(),
            max_advance_days: 90,
        }
    }
}

impl Schedule {
    /// All slot start times of an open day.
    pub fn slot_times(&self) -> Vec<SlotTime> {
        let step = self.slot_minutes.max(1);
        (self.opening.minutes()..self.closing.minutes())
            .step_by(step as usize)
            .filter_map(SlotTime::from_minutes)
            .collect()
    }

    pub fn is_slot_start(&self, time: SlotTime) -> bool {
        let step = self.slot_minutes.max(1);
        time >= self.opening
            && time < self.closing
            && (time.minutes() - self.opening.minutes()) % step == 0
    }
}

/// Day-level closure, checked in order: past, too far ahead, blackout, weekday.
pub fn day_closed_reason(schedule: &Schedule, date: NaiveDate, today: NaiveDate) -> Option<UnavailableReason> {
    if date < today {
        return Some(UnavailableReason::PastDate);
    }
    if (date - today).num_days() > schedule.max_advance_days {
        return Some(UnavailableReason::TooFarAdvance);
    }
    if schedule.blackout_dates.contains(&date) {
        return Some(UnavailableReason::BlackoutDate);
    }
    if !schedule.working_days.contains(&date.weekday()) {
        return Some(UnavailableReason::NonWorkingDay);
    }
    None
}

/// Slot times still bookable by `client` (its own hold does not block it).
/// On `today` only times strictly after `now_tod` count.
pub fn free_times(
    schedule: &Schedule,
    state: &ScopeState,
    client: Option<ClientId>,
    today: NaiveDate,
    now_tod: SlotTime,
    now: Ms,
) -> Vec<SlotTime> {
    if day_closed_reason(schedule, state.scope.date, today).is_some() {
        return Vec::new();
    }
    let is_today = state.scope.date == today;
    schedule
        .slot_times()
        .into_iter()
        .filter(|t| !is_today || *t > now_tod)
        .filter(|t| !state.is_taken(*t, client, None, now))
        .collect()
}

/// Free times other than `contended`, nearest first (earlier wins a tie).
pub fn suggest_alternatives(
    schedule: &Schedule,
    state: &ScopeState,
    contended: SlotTime,
    client: Option<ClientId>,
    today: NaiveDate,
    now_tod: SlotTime,
    now: Ms,
    limit: usize,
) -> Vec<SlotTime> {
    let mut free: Vec<SlotTime> = free_times(schedule, state, client, today, now_tod, now)
        .into_iter()
        .filter(|t| *t != contended)
        .collect();
    free.sort_by_key(|t| (t.distance(contended), *t));
    free.truncate(limit);
    free
}
