use std::str::FromStr;
use std::time::Duration;

use crate::limits::*;
use crate::model::Ms;

/// Which `PollingTransport` the connection manager builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Custom fixed interval, discrete action requests.
    Interval,
    /// Host-bound heartbeat tick with piggybacked actions.
    Heartbeat,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interval" | "poll" => Ok(TransportKind::Interval),
            "heartbeat" => Ok(TransportKind::Heartbeat),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub lock_ttl_ms: Ms,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub transport: TransportKind,
    pub request_timeout: Duration,
    /// How long a local optimistic edit may shadow the snapshot.
    pub optimistic_shadow_ms: Ms,
    pub urgent_threshold_ms: Ms,
    pub reaper_interval: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_millis(MAX_HEARTBEAT_INTERVAL_MS),
            transport: TransportKind::Interval,
            request_timeout: Duration::from_secs(10),
            optimistic_shadow_ms: 30_000,
            urgent_threshold_ms: DEFAULT_URGENT_THRESHOLD_MS,
            reaper_interval: Duration::from_secs(5),
            metrics_port: None,
        }
    }
}

impl Config {
    /// Read `SLOTSYNC_*` variables; anything missing or malformed keeps its default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(&format!("SLOTSYNC_{name}"));
        // Durations outside (0, MAX_CONFIG_DURATION_MS] count as malformed.
        let get_ms = |name: &str| {
            get(name)
                .and_then(|s| s.trim().parse::<Ms>().ok())
                .filter(|ms| (1..=MAX_CONFIG_DURATION_MS).contains(ms))
        };
        let get_duration = |name: &str| get_ms(name).map(|ms| Duration::from_millis(ms as u64));
        let defaults = Self::default();

        let heartbeat_ms = get_ms("HEARTBEAT_INTERVAL_MS")
            .map_or(defaults.heartbeat_interval.as_millis() as u64, |ms| ms as u64)
            .clamp(MIN_HEARTBEAT_INTERVAL_MS, MAX_HEARTBEAT_INTERVAL_MS);

        Self {
            lock_ttl_ms: get_ms("LOCK_TTL_MS").unwrap_or(defaults.lock_ttl_ms),
            poll_interval: get_duration("POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval),
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            transport: get("TRANSPORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.transport),
            request_timeout: get_duration("REQUEST_TIMEOUT_MS").unwrap_or(defaults.request_timeout),
            optimistic_shadow_ms: get_ms("OPTIMISTIC_SHADOW_MS").unwrap_or(defaults.optimistic_shadow_ms),
            urgent_threshold_ms: get_ms("URGENT_THRESHOLD_MS").unwrap_or(defaults.urgent_threshold_ms),
            reaper_interval: get_duration("REAPER_INTERVAL_MS").unwrap_or(defaults.reaper_interval),
            metrics_port: get("METRICS_PORT").and_then(|s| s.trim().parse().ok()),
        }
    }

    /// Cadence of the configured transport.
    pub fn cadence(&self) -> Duration {
        match self.transport {
            TransportKind::Interval => self.poll_interval,
            TransportKind::Heartbeat => self.heartbeat_interval,
        }
    }
}
