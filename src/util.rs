//! Small utility functions shared across the driver.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Performs `ceil(a / b)` for unsigned integers.
pub fn ceil_div(a: u64, b: u64) -> u64 {
    if b == 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

/// Returns `log2(n)`, or `None` if `n` is zero.
pub fn log2(n: u64) -> Option<u32> {
    if n == 0 {
        None
    } else {
        Some(63 - n.leading_zeros())
    }
}

/// Returns the current time as seconds since the Unix epoch.
///
/// Callers that need deterministic timestamps (tests, replayed images)
/// should bypass this and pass an explicit value instead.
pub fn now_unix() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as u32
}

/// A byte count with a human-readable `Display` impl.
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = log2(self.0).unwrap_or(0) / log2(1024).unwrap();
        let (order, suffix) = match order {
            0 => (0, "bytes"),
            1 => (1, "KiB"),
            2 => (2, "MiB"),
            3 => (3, "GiB"),
            4 => (4, "TiB"),
            _ => (0, "bytes"),
        };
        let unit = 1024u64.pow(order);
        write!(fmt, "{} {}", self.0 / unit.max(1), suffix)
    }
}
