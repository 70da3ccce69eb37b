use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::model::Ms;
use crate::store::SlotStore;

const TICK_MS: Ms = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerBand {
    Normal,
    /// Under the urgent threshold.
    Urgent,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerReading {
    pub remaining_ms: Ms,
    pub band: TimerBand,
}

/// `MM:SS`, rounded up to the next whole second.
impl fmt::Display for TimerReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = (self.remaining_ms.max(0) + 999) / 1000;
        write!(f, "{:02}:{:02}", secs / 60, secs % 60)
    }
}

type ExpireHook = Box<dyn FnMut() + Send>;

/// Countdown shown while a slot is held. Reading it never changes it; only
/// [`tick`](Self::tick) does, and the expiry hook runs once per hold.
pub struct LockTimer {
    lock_duration_ms: Ms,
    urgent_threshold_ms: Ms,
    remaining_ms: Ms,
    fired: bool,
    on_expire: Option<ExpireHook>,
}

impl LockTimer {
    pub fn new(lock_duration_ms: Ms, urgent_threshold_ms: Ms) -> Self {
        Self {
            lock_duration_ms,
            urgent_threshold_ms,
            remaining_ms: lock_duration_ms.max(0),
            fired: false,
            on_expire: None,
        }
    }

    pub fn on_expire(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.on_expire = Some(Box::new(hook));
        self
    }

    pub fn reading(&self) -> TimerReading {
        let band = if self.remaining_ms <= 0 {
            TimerBand::Expired
        } else if self.remaining_ms < self.urgent_threshold_ms {
            TimerBand::Urgent
        } else {
            TimerBand::Normal
        };
        TimerReading {
            remaining_ms: self.remaining_ms,
            band,
        }
    }

    pub fn has_expired(&self) -> bool {
        self.remaining_ms <= 0
    }

    /// Advance one second.
    pub fn tick(&mut self) -> TimerReading {
        self.remaining_ms = (self.remaining_ms - TICK_MS).max(0);
        self.fire_if_expired();
        self.reading()
    }

    fn fire_if_expired(&mut self) {
        if self.remaining_ms > 0 || self.fired {
            return;
        }
        self.fired = true;
        info!("soft lock timer expired");
        if let Some(hook) = self.on_expire.as_mut() {
            hook();
        }
    }

    /// The hold was renewed: full duration, hook armed again.
    pub fn reset(&mut self) {
        self.remaining_ms = self.lock_duration_ms.max(0);
        self.fired = false;
    }

    /// Align with the server's expiry so the display does not drift from the
    /// hold it describes. Never re-arms an expired timer.
    pub fn sync_to(&mut self, expires_at: Ms, now: Ms) -> TimerReading {
        if !self.fired {
            self.remaining_ms = (expires_at - now).clamp(0, self.lock_duration_ms.max(0));
            self.fire_if_expired();
        }
        self.reading()
    }

    /// Tick every second, publishing each reading, until expiry or cancel.
    pub async fn run(mut self, readings: watch::Sender<TimerReading>, cancel: CancellationToken) {
        self.fire_if_expired();
        let _ = readings.send(self.reading());
        let mut interval = tokio::time::interval(Duration::from_millis(TICK_MS as u64));
        // first tick completes immediately
        interval.tick().await;
        while !self.has_expired() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("lock timer cancelled");
                    return;
                }
                _ = interval.tick() => {}
            }
            let _ = readings.send(self.tick());
        }
    }

    /// Like [`run`](Self::run), but follows the hold the server reports for
    /// this visitor: every snapshot carrying `own_selection` resyncs the
    /// countdown to its `expires_at`.
    pub async fn follow(mut self, store: SlotStore, readings: watch::Sender<TimerReading>, cancel: CancellationToken) {
        let mut state_rx = store.subscribe();
        let expires_at = state_rx.borrow_and_update().own_selection.map(|o| o.expires_at);
        if let Some(expires_at) = expires_at {
            self.sync_to(expires_at, store.clock().now_ms());
        }
        self.fire_if_expired();
        let _ = readings.send(self.reading());

        let mut interval = tokio::time::interval(Duration::from_millis(TICK_MS as u64));
        interval.tick().await;
        while !self.has_expired() {
            let reading = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("lock timer cancelled");
                    return;
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let expires_at = state_rx.borrow_and_update().own_selection.map(|o| o.expires_at);
                    match expires_at {
                        Some(expires_at) => self.sync_to(expires_at, store.clock().now_ms()),
                        None => continue,
                    }
                }
                _ = interval.tick() => self.tick(),
            };
            let _ = readings.send(reading);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::NaiveDate;

    use super::*;
    use crate::clock::Clock;
    use crate::model::*;

    // 2025-09-19T08:00:00Z
    const START: Ms = 1_758_268_800_000;

    fn scope() -> Scope {
        Scope::new(NaiveDate::from_ymd_opt(2025, 9, 20).unwrap(), EmployeeId(7))
    }

    fn snapshot(as_of: u64, expires_at: Option<Ms>) -> ReservationSnapshot {
        ReservationSnapshot {
            scope: scope(),
            booked_slots: SlotSet::default(),
            active_selections: vec![],
            locked_slots: vec![],
            own_selection: expires_at.map(|expires_at| OwnSelection {
                time: "10:00".parse().unwrap(),
                expires_at,
            }),
            closed_reason: None,
            as_of,
            server_time: START,
        }
    }

    fn counting(duration: Ms) -> (LockTimer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let hook = fired.clone();
        let timer = LockTimer::new(duration, 2_000).on_expire(move || {
            hook.fetch_add(1, Ordering::SeqCst);
        });
        (timer, fired)
    }

    #[test]
    fn expires_once_after_enough_ticks() {
        let (mut timer, fired) = counting(5_000);
        for _ in 0..4 {
            assert_ne!(timer.tick().band, TimerBand::Expired);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        assert_eq!(timer.tick().band, TimerBand::Expired);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        timer.tick();
        timer.tick();
        let _ = timer.reading();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bands_follow_threshold() {
        let mut timer = LockTimer::new(3_000, 2_000);
        assert_eq!(timer.reading().band, TimerBand::Normal);
        assert_eq!(timer.tick().band, TimerBand::Normal); // exactly at threshold
        assert_eq!(timer.tick().band, TimerBand::Urgent);
        assert_eq!(timer.tick().band, TimerBand::Expired);
    }

    #[test]
    fn reset_rearms() {
        let (mut timer, fired) = counting(1_000);
        timer.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.reset();
        assert_eq!(timer.reading().remaining_ms, 1_000);
        timer.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn sync_clamps_to_duration() {
        let mut timer = LockTimer::new(600_000, 120_000);
        timer.sync_to(1_000 + 90_000, 1_000);
        assert_eq!(timer.reading().remaining_ms, 90_000);
        assert_eq!(timer.reading().band, TimerBand::Urgent);
        timer.sync_to(10_000_000, 0);
        assert_eq!(timer.reading().remaining_ms, 600_000);
    }

    #[test]
    fn display_rounds_up() {
        let r = |ms| TimerReading {
            remaining_ms: ms,
            band: TimerBand::Normal,
        };
        assert_eq!(r(600_000).to_string(), "10:00");
        assert_eq!(r(119_001).to_string(), "02:00");
        assert_eq!(r(0).to_string(), "00:00");
    }

    #[test]
    fn sync_to_expiry_fires_hook() {
        let (mut timer, fired) = counting(600_000);
        assert_eq!(timer.sync_to(1_000, 1_000).band, TimerBand::Expired);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.sync_to(500_000, 1_000);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timer.has_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn run_fires_hook_for_already_expired_timer() {
        let (timer, fired) = counting(0);
        let (tx, _rx) = watch::channel(timer.reading());
        timer.run(tx, CancellationToken::new()).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn follow_tracks_reported_hold() {
        let clock = Clock::manual(START);
        let store = SlotStore::new(clock.clone(), 30_000);
        store.clear_slots(Some(scope()));
        let (timer, fired) = counting(600_000);
        let (tx, mut rx) = watch::channel(timer.reading());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(timer.follow(store.clone(), tx, cancel.clone()));
        tokio::task::yield_now().await;

        // the server says the hold lapses in 90 s
        store.apply_snapshot(&snapshot(1, Some(START + 90_000)));
        while rx.borrow_and_update().remaining_ms != 90_000 {
            rx.changed().await.unwrap();
        }
        assert_eq!(rx.borrow().band, TimerBand::Urgent);

        // and then that it ended early
        clock.advance(90_000);
        store.apply_snapshot(&snapshot(2, Some(START + 60_000)));
        handle.await.unwrap();
        assert_eq!(rx.borrow().band, TimerBand::Expired);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(cancel);
    }

    #[tokio::test(start_paused = true)]
    async fn run_publishes_each_second() {
        let (timer, fired) = counting(5_000);
        let (tx, mut rx) = watch::channel(timer.reading());
        let handle = tokio::spawn(timer.run(tx, CancellationToken::new()));

        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            seen.push(rx.borrow_and_update().remaining_ms);
        }
        handle.await.unwrap();

        assert_eq!(seen.last(), Some(&0));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
