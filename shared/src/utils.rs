//! Small time/formatting helpers used throughout the manager, the way
//! the teacher's `shared::utils` collects cross-cutting helpers
//! (`examples/macwilam-linksense/shared/src/utils.rs`).

use std::time::{SystemTime, UNIX_EPOCH};

/// Microsecond timestamp, matching the original's `timestamp_t`
/// (`timestamp_get()` returns microseconds since the epoch).
pub type Timestamp = u64;

pub fn now_micros() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_micros() as Timestamp
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

/// Format a byte count with a human-readable unit suffix, for log lines.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}
