use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, NaiveDateTime, Utc};

// Second-precision timestamps shared through the routing tables,
// e.g. `2026-08-01T10:15:42Z`.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// A trait for a clock that can provide the current time
/// as a UNIX timestamp in seconds.
pub trait Clock {
    fn now(&self) -> u64;
}

/// A default implementation of a clock that uses the system time.
pub struct DefaultClock {}

impl DefaultClock {
    /// Creates a new instance of the default clock
    /// that uses system time.
    pub fn new() -> Self {
        DefaultClock {}
    }
}

impl Default for DefaultClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for DefaultClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_secs()
    }
}

/// A clock that only moves when told to, used to compress retry and
/// staleness windows in tests and local experiments.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        ManualClock {
            now: AtomicU64::new(start),
        }
    }

    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Formats a UNIX timestamp in seconds as an ISO-8601 UTC timestamp with
/// second precision.
pub fn format_timestamp(unix_secs: u64) -> String {
    let datetime = DateTime::<Utc>::from_timestamp(unix_secs as i64, 0)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).expect("epoch is representable"));
    datetime.format(TIMESTAMP_FORMAT).to_string()
}

/// Parses an ISO-8601 UTC timestamp with second precision back into a UNIX
/// timestamp in seconds. Returns `None` for unparsable values so callers can
/// treat corrupt table entries the same way as missing ones.
pub fn parse_timestamp(value: &str) -> Option<u64> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc().timestamp().max(0) as u64)
}
