//! Utility module
//!
//! Time helpers shared by the engine, the registry and the store. Peer
//! bookkeeping runs on whole unix seconds.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Whole seconds since the unix epoch
pub fn unix_now() -> u64 {
    system_time_to_unix(SystemTime::now())
}

/// Converts a system time to whole unix seconds, clamping pre-epoch times to zero
pub fn system_time_to_unix(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Formats unix seconds as an RFC 3339 UTC timestamp
pub fn format_unix(secs: u64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs.min(i64::MAX as u64) as i64, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| secs.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_conversion() {
        let now = unix_now();
        assert!(now > 1_600_000_000);
        assert_eq!(system_time_to_unix(UNIX_EPOCH + Duration::from_secs(now)), now);
        assert_eq!(system_time_to_unix(UNIX_EPOCH - Duration::from_secs(5)), 0);
    }

    #[test]
    fn test_format_unix() {
        assert_eq!(format_unix(1_700_000_000), "2023-11-14T22:13:20Z");
        assert_eq!(format_unix(0), "1970-01-01T00:00:00Z");
    }
}
