//! Wall-clock helpers shared by the queues, the dispatcher and versioning.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in microseconds since the UNIX epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

/// Current wall-clock time in whole seconds since the UNIX epoch.
pub fn now_s() -> i64 {
    (now_us() / USEC_PER_SEC) as i64
}

/// Microseconds per second.
pub const USEC_PER_SEC: u64 = 1_000_000;
