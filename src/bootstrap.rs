//! Session bootstrap: connection bring-up through the START_REPLICATION
//! handshake.
//!
//! Every step either succeeds or returns an error with the connection
//! already closed — callers never have to clean up a half-open handle.

use crate::config::ReplicatorConfig;
use crate::driver::PgDriver;
use crate::errors::{ReplicationError, ReplicationResult};
use crate::lsn::Lsn;
use std::time::Duration;

/// Falls back only when the caller left `status_interval` unset *and* the
/// server's `wal_receiver_status_interval` GUC could not be read or parsed.
const FALLBACK_STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Server identity as reported by `IDENTIFY_SYSTEM`, reconciled against the
/// caller's configuration.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub systemid: String,
    pub timeline: i64,
    pub dbname: String,
    /// The resolved feedback cadence: the caller's `status_interval` if set,
    /// otherwise the server's `wal_receiver_status_interval` GUC.
    pub status_interval: Duration,
}

/// Runs the full bootstrap sequence against an already-open driver. Closes
/// `driver` and returns the error on any failure.
pub fn bootstrap<D: PgDriver>(
    driver: &mut D,
    config: &ReplicatorConfig,
) -> ReplicationResult<SessionIdentity> {
    match bootstrap_inner(driver, config) {
        Ok(identity) => Ok(identity),
        Err(err) => {
            driver.close();
            Err(err)
        }
    }
}

fn bootstrap_inner<D: PgDriver>(
    driver: &mut D,
    config: &ReplicatorConfig,
) -> ReplicationResult<SessionIdentity> {
    if !driver.is_healthy() {
        return Err(ReplicationError::connection(format!(
            "connection is not healthy: {}",
            driver.error_message()
        )));
    }

    // The composed conninfo only injects replication=database when the key
    // was absent (see config.rs); a caller-supplied conninfo string can still
    // set it explicitly to something else. Read back what libpq actually
    // resolved rather than trusting the string we built.
    match driver.conninfo_parameter("replication")? {
        Some(ref v) if v == "database" => {}
        other => {
            return Err(ReplicationError::connection(format!(
                "replication parameter must be \"database\", got {other:?}"
            )));
        }
    }

    // Major version >= 10: close a privilege-escalation vector on shared
    // servers by resetting search_path for the duration of the session.
    if driver.server_version() / 10000 >= 10 {
        let result = driver.exec("SELECT pg_catalog.set_config('search_path', '', false)")?;
        if !result.is_ok() {
            return Err(ReplicationError::session_invariant(format!(
                "search_path reset failed: {}",
                result.status_debug()
            )));
        }
    }

    match driver.parameter_status("integer_datetimes") {
        Some(ref v) if v == "on" => {}
        Some(other) => {
            return Err(ReplicationError::session_invariant(format!(
                "server reports integer_datetimes={other:?}, expected \"on\""
            )));
        }
        None => {
            return Err(ReplicationError::session_invariant(
                "server did not report integer_datetimes",
            ));
        }
    }

    let identify = driver.exec("IDENTIFY_SYSTEM")?;
    if !identify.is_ok() || identify.ntuples() != 1 {
        return Err(ReplicationError::protocol(format!(
            "IDENTIFY_SYSTEM returned unexpected result: {}",
            identify.status_debug()
        )));
    }
    let server_systemid = identify
        .getvalue(0, 0)
        .ok_or_else(|| ReplicationError::protocol("IDENTIFY_SYSTEM missing systemid column"))?;
    let server_timeline: i64 = identify
        .getvalue(0, 1)
        .ok_or_else(|| ReplicationError::protocol("IDENTIFY_SYSTEM missing timeline column"))?
        .parse()
        .map_err(|_| ReplicationError::protocol("IDENTIFY_SYSTEM returned non-numeric timeline"))?;
    let server_dbname = identify
        .getvalue(0, 2)
        .ok_or_else(|| ReplicationError::protocol("IDENTIFY_SYSTEM missing dbname column"))?;

    if let Some(ref wanted) = config.systemid {
        if wanted != &server_systemid {
            return Err(ReplicationError::identity_mismatch(format!(
                "Specified systemid: {wanted}, Server systemid: {server_systemid}"
            )));
        }
    }

    if let Some(wanted) = config.timeline {
        if wanted != server_timeline {
            return Err(ReplicationError::identity_mismatch(format!(
                "Specified timeline: {wanted}, Server timeline: {server_timeline}"
            )));
        }
    }

    // dbname absent from the caller's config: adopt the server's value
    // rather than comparing against an implicit null.
    if let Some(ref wanted) = config.dbname {
        if wanted != &server_dbname {
            return Err(ReplicationError::identity_mismatch(format!(
                "Specified dbname: {wanted}, Server dbname: {server_dbname}"
            )));
        }
    }

    let status_interval = resolve_status_interval(driver, config)?;

    let start_replication_sql = compose_start_replication(driver, config)?;
    let result = driver.exec(&start_replication_sql)?;
    if !result.is_copy_both() {
        return Err(ReplicationError::protocol(format!(
            "START_REPLICATION did not enter CopyBoth mode: {} (command: {start_replication_sql})",
            result.status_debug()
        )));
    }

    Ok(SessionIdentity {
        systemid: server_systemid,
        timeline: server_timeline,
        dbname: server_dbname,
        status_interval,
    })
}

/// Spec §3: `status_interval` "defaults to the server's
/// `wal_receiver_status_interval` GUC" when the caller didn't supply one.
/// That default can't be known until a connection exists, so it is resolved
/// here rather than at config-parse time.
fn resolve_status_interval<D: PgDriver>(
    driver: &D,
    config: &ReplicatorConfig,
) -> ReplicationResult<Duration> {
    if let Some(configured) = config.status_interval {
        return Ok(configured);
    }

    let result = driver.exec("SHOW wal_receiver_status_interval")?;
    match result.getvalue(0, 0) {
        Some(raw) => parse_pg_interval(&raw).or_else(|_| {
            tracing::warn!(
                raw = %raw,
                "could not parse wal_receiver_status_interval, using fallback"
            );
            Ok(FALLBACK_STATUS_INTERVAL)
        }),
        None => {
            tracing::warn!("server did not report wal_receiver_status_interval, using fallback");
            Ok(FALLBACK_STATUS_INTERVAL)
        }
    }
}

/// Parses a PostgreSQL GUC duration string (`"10s"`, `"500ms"`, `"2min"`,
/// `"1h"`, a bare number of seconds, ...) into a `Duration`.
fn parse_pg_interval(raw: &str) -> ReplicationResult<Duration> {
    let raw = raw.trim();
    let split_at = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split_at);
    let value: f64 = number
        .parse()
        .map_err(|_| ReplicationError::protocol(format!("malformed GUC duration: {raw:?}")))?;
    let secs = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1_000.0,
        "min" => value * 60.0,
        "h" => value * 3_600.0,
        "d" => value * 86_400.0,
        other => {
            return Err(ReplicationError::protocol(format!(
                "unrecognized GUC duration unit: {other:?}"
            )));
        }
    };
    if secs < 0.0 {
        return Err(ReplicationError::protocol(format!(
            "negative GUC duration: {raw:?}"
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn compose_start_replication<D: PgDriver>(
    driver: &D,
    config: &ReplicatorConfig,
) -> ReplicationResult<String> {
    let start_lsn = if config.start_position.is_valid() {
        config.start_position
    } else {
        Lsn::INVALID
    };
    let options = config.render_plugin_options(driver)?;
    Ok(format!(
        "START_REPLICATION SLOT {} LOGICAL {}{}",
        driver.escape_literal(&config.slot)?,
        start_lsn.to_canonical(),
        options
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use std::collections::HashMap;

    fn base_config(extra: &[(&str, &str)]) -> ReplicatorConfig {
        let mut map: HashMap<String, String> =
            [("slot".to_string(), "test_slot".to_string())].into();
        for (k, v) in extra {
            map.insert(k.to_string(), v.to_string());
        }
        ReplicatorConfig::from_options(map).unwrap()
    }

    #[test]
    fn happy_path_reconciles_identity() {
        let mut driver = MockDriver::default()
            .with_identify_system("6821345681238281838", "1", "postgres")
            .with_integer_datetimes(true);
        let config = base_config(&[]);
        let identity = bootstrap(&mut driver, &config).unwrap();
        assert_eq!(identity.timeline, 1);
        assert_eq!(identity.dbname, "postgres");
    }

    #[test]
    fn timeline_mismatch_names_both_values() {
        let mut driver = MockDriver::default()
            .with_identify_system("1", "1", "postgres")
            .with_integer_datetimes(true);
        let config = base_config(&[("timeline", "2")]);
        let err = bootstrap(&mut driver, &config).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Specified timeline: 2"));
        assert!(msg.contains("Server timeline: 1"));
    }

    #[test]
    fn systemid_mismatch_names_both_values() {
        let mut driver = MockDriver::default()
            .with_identify_system("1", "1", "postgres")
            .with_integer_datetimes(true);
        let config = base_config(&[("systemid", "2")]);
        let err = bootstrap(&mut driver, &config).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Specified systemid: 2"));
        assert!(msg.contains("Server systemid: 1"));
    }

    #[test]
    fn missing_integer_datetimes_is_fatal() {
        let mut driver =
            MockDriver::default().with_identify_system("1", "1", "postgres");
        let config = base_config(&[]);
        let err = bootstrap(&mut driver, &config).unwrap_err();
        assert!(matches!(err, ReplicationError::SessionInvariant { .. }));
    }

    #[test]
    fn unhealthy_connection_fails_before_any_query() {
        let mut driver = MockDriver {
            healthy: false,
            ..MockDriver::default()
        };
        let config = base_config(&[]);
        let err = bootstrap(&mut driver, &config).unwrap_err();
        assert!(matches!(err, ReplicationError::Connection { .. }));
        assert!(*driver.closed.borrow());
    }

    #[test]
    fn replication_parameter_mismatch_is_connection_error() {
        let mut driver = MockDriver::default()
            .with_identify_system("1", "1", "postgres")
            .with_integer_datetimes(true)
            .with_conninfo_param("replication", "physical");
        let config = base_config(&[]);
        let err = bootstrap(&mut driver, &config).unwrap_err();
        assert!(matches!(err, ReplicationError::Connection { .. }));
        assert!(*driver.closed.borrow());
    }

    #[test]
    fn slot_name_is_escaped_as_a_string_literal() {
        let mut driver = MockDriver::default()
            .with_identify_system("1", "1", "postgres")
            .with_integer_datetimes(true);
        let config = base_config(&[]);
        bootstrap(&mut driver, &config).unwrap();
        let sent = driver.last_query.borrow().clone().unwrap();
        assert!(sent.contains("SLOT 'test_slot'"));
        assert!(!sent.contains("\"test_slot\""));
    }

    #[test]
    fn explicit_status_interval_skips_guc_lookup() {
        let mut driver = MockDriver::default()
            .with_identify_system("1", "1", "postgres")
            .with_integer_datetimes(true);
        let config = base_config(&[("status_interval", "5")]);
        let identity = bootstrap(&mut driver, &config).unwrap();
        assert_eq!(identity.status_interval, Duration::from_secs(5));
        assert_ne!(
            *driver.last_query.borrow(),
            Some("SHOW wal_receiver_status_interval".to_string())
        );
    }

    #[test]
    fn unset_status_interval_resolves_from_server_guc() {
        let mut driver = MockDriver::default()
            .with_identify_system("1", "1", "postgres")
            .with_integer_datetimes(true);
        driver.responses.insert(
            "SHOW wal_receiver_status_interval".to_string(),
            crate::driver::mock::MockResult {
                ok: true,
                copy_both: false,
                rows: vec![vec!["15s".to_string()]],
            },
        );
        let config = base_config(&[]);
        let identity = bootstrap(&mut driver, &config).unwrap();
        assert_eq!(identity.status_interval, Duration::from_secs(15));
    }

    #[test]
    fn missing_guc_falls_back_to_default() {
        let mut driver = MockDriver::default()
            .with_identify_system("1", "1", "postgres")
            .with_integer_datetimes(true);
        let config = base_config(&[]);
        let identity = bootstrap(&mut driver, &config).unwrap();
        assert_eq!(identity.status_interval, FALLBACK_STATUS_INTERVAL);
    }

    #[test]
    fn parses_various_guc_duration_units() {
        assert_eq!(parse_pg_interval("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_pg_interval("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_pg_interval("2min").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_pg_interval("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_pg_interval("10").unwrap(), Duration::from_secs(10));
        assert!(parse_pg_interval("garbage").is_err());
    }
}
