//! Time-related utilities
//!
//! Trace timestamps are signed nanoseconds since the UNIX epoch.

use chrono::{DateTime, Utc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::types::activity::Timestamp;

/// Get the current system time in nanoseconds since UNIX epoch
pub fn system_time_nanos() -> Timestamp {
    to_epoch_nanos(SystemTime::now())
}

/// Convert a wall-clock time point to epoch nanoseconds.
/// Times before the epoch clamp to 0.
pub fn to_epoch_nanos(time: SystemTime) -> Timestamp {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as Timestamp)
        .unwrap_or(0)
}

/// Convert epoch nanoseconds back to a wall-clock time point
pub fn from_epoch_nanos(nanos: Timestamp) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos.max(0) as u64)
}

/// Human readable RFC 3339 rendering, for log lines
pub fn format_timestamp(nanos: Timestamp) -> String {
    let secs = nanos.div_euclid(1_000_000_000);
    let subsec = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, subsec)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| nanos.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_time() {
        let nanos = system_time_nanos();

        // Basic sanity check
        assert!(nanos > 1_600_000_000 * 1_000_000_000); // After 2020
    }

    #[test]
    fn test_epoch_conversion() {
        let t = UNIX_EPOCH + Duration::from_micros(100);
        assert_eq!(to_epoch_nanos(t), 100_000);
        assert_eq!(from_epoch_nanos(100_000), t);
        assert_eq!(from_epoch_nanos(-5), UNIX_EPOCH);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00+00:00");
    }
}
