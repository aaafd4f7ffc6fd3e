//! Common utilities: bit-level parsing, CRC, and URL helpers.

pub mod bits;
pub mod crc;
pub mod url;

pub use bits::BitReader;
pub use crc::Crc32Mpeg2;

use std::time::Duration;

/// Converts a stream-relative duration to a millisecond timestamp.
pub fn time_to_ts(t: Duration) -> i32 {
    t.as_millis() as i32
}

/// Converts a 90 kHz PTS value to a duration.
pub fn pts_to_time(pts: i64) -> Duration {
    Duration::from_millis((pts / 90) as u64)
}
