use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, NaiveDate, Timelike};

use crate::model::{Ms, SlotTime};

/// Wall-clock source. `Manual` is advanced explicitly (tests, simulations).
#[derive(Debug, Clone, Default)]
pub enum Clock {
    #[default]
    System,
    Manual(Arc<AtomicI64>),
}

impl Clock {
    pub fn manual(start: Ms) -> Self {
        Clock::Manual(Arc::new(AtomicI64::new(start)))
    }

    pub fn now_ms(&self) -> Ms {
        match self {
            Clock::System => std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as Ms)
                .unwrap_or_default(),
            Clock::Manual(ms) => ms.load(Ordering::SeqCst),
        }
    }

    /// No-op on the system clock.
    pub fn advance(&self, by: Ms) {
        if let Clock::Manual(ms) = self {
            ms.fetch_add(by, Ordering::SeqCst);
        }
    }

    /// Current UTC date.
    pub fn today(&self) -> NaiveDate {
        DateTime::from_timestamp_millis(self.now_ms())
            .map(|dt| dt.date_naive())
            .unwrap_or_default()
    }

    /// Current UTC time of day, truncated to the minute.
    pub fn time_of_day(&self) -> SlotTime {
        DateTime::from_timestamp_millis(self.now_ms())
            .and_then(|dt| SlotTime::from_hm(dt.hour() as u16, dt.minute() as u16))
            .unwrap_or_default()
    }
}
