//! Wall clock helpers. All index timestamps are milliseconds since the Unix epoch.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Combines wire seconds and nanoseconds into milliseconds.
pub fn millis_from_parts(secs: i64, nanos: i32) -> i64 {
    secs * 1000 + (nanos / 1_000_000) as i64
}

/// Splits milliseconds into wire seconds and nanoseconds.
pub fn parts_from_millis(millis: i64) -> (i64, i32) {
    let secs = millis.div_euclid(1000);
    let nanos = (millis.rem_euclid(1000) * 1_000_000) as i32;
    (secs, nanos)
}
