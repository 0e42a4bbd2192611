//! PostgreSQL timestamp conversion
//!
//! The replication wire protocol stamps every message with the sender's clock
//! as microseconds since midnight 2000-01-01 UTC ("the PostgreSQL epoch").
//! `integer_datetimes` (checked during bootstrap) guarantees this is an
//! integer count, not a float.

use chrono::{DateTime, Utc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds from the Unix epoch (1970-01-01) to the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Convert a `SystemTime` into PostgreSQL's microseconds-since-2000-01-01 form.
pub fn to_pg_micros(time: SystemTime) -> i64 {
    let since_unix = time
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime is before the Unix epoch");
    let unix_micros = since_unix.as_secs() as i64 * 1_000_000 + since_unix.subsec_micros() as i64;
    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}

/// Convert PostgreSQL's microseconds-since-2000-01-01 form back into a `SystemTime`.
pub fn from_pg_micros(micros: i64) -> SystemTime {
    let unix_micros = micros + PG_EPOCH_OFFSET_SECS * 1_000_000;
    if unix_micros >= 0 {
        UNIX_EPOCH + Duration::from_micros(unix_micros as u64)
    } else {
        UNIX_EPOCH - Duration::from_micros((-unix_micros) as u64)
    }
}

/// Render a server-side send timestamp for logging, e.g. in feedback and
/// WAL-data trace lines.
pub fn format_pg_micros(micros: i64) -> String {
    let dt: DateTime<Utc> = from_pg_micros(micros).into();
    dt.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pg_epoch_is_zero() {
        let epoch = UNIX_EPOCH + Duration::from_secs(PG_EPOCH_OFFSET_SECS as u64);
        assert_eq!(to_pg_micros(epoch), 0);
    }

    #[test]
    fn round_trips_through_micros() {
        let now = SystemTime::now();
        let micros = to_pg_micros(now);
        let back = from_pg_micros(micros);
        let delta = now.duration_since(back).unwrap_or_else(|e| e.duration());
        assert!(delta < Duration::from_micros(1));
    }
}
