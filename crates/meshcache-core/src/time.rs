//! Wall-clock helpers.

use std::time::SystemTime;

/// Current time as seconds since UNIX epoch
pub fn now_seconds() -> u64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .unwrap_or_default()
        .as_secs()
}

/// Current time as milliseconds since UNIX epoch
pub fn now_millis() -> u64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .unwrap_or_default()
        .as_millis() as u64
}
