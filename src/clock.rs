//! A monotonic-enough microsecond clock for probe timestamps.
//!
//! The Link daemon only cares that times are comparable and
//! increasing within a session, not that they share an epoch with
//! anything else, so wall-clock microseconds are sufficient.

pub fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
