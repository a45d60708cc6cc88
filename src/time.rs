//! Time units used throughout the engine.
//!
//! All persisted timestamps are milliseconds since the Unix epoch so that
//! state written by one process is meaningful to any other. Durations that
//! come out of the rate math (retry delays, clock offsets) are fractional
//! milliseconds.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// A duration or clock offset in (possibly fractional) milliseconds.
pub type Milliseconds = f64;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}
