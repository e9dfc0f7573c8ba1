//! The `timing` module provides std::time utility functions.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn duration_as_us(d: &Duration) -> u64 {
    (d.as_secs() * 1_000_000) + u64::from(d.subsec_micros())
}

/// A number of microseconds since the unix epoch. Request timestamps ride
/// the wire truncated to 32 bits and compare by wrapping subtraction.
pub fn timestamp_us() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("create timestamp in timing");
    duration_as_us(&now)
}
