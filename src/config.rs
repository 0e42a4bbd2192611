//! Config Parser
//!
//! Normalizes caller-supplied options — a `HashMap<String, String>` of named
//! options, or a libpq keyword/value conninfo string — into a validated
//! `ReplicatorConfig`. Reserved keys are pulled out of the conninfo before it
//! reaches the driver; `replication=database` is injected if the caller
//! didn't already set it.
//!
//! # Environment variables
//!
//! The engine's library surface never reads the environment itself — only
//! [`ReplicatorConfig::from_env`], used by the example binary, does:
//!
//! - `DATABASE_URL` (required): libpq connection string
//! - `SLOT_NAME` (required): replication slot name
//! - `START_POSITION` / `END_POSITION` (optional): LSN literals
//! - `STATUS_INTERVAL_SECS` (optional; unset defers to the server's
//!   `wal_receiver_status_interval` GUC, resolved at bootstrap)

use crate::errors::{ReplicationError, ReplicationResult};
use crate::lsn::Lsn;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

const RESERVED_KEYS: &[&str] = &[
    "slot",
    "start_position",
    "startpos",
    "end_position",
    "endpos",
    "timeline",
    "systemid",
    "status_interval",
    "plugin_options",
];

/// A single plugin option value, rendered the way `START_REPLICATION`'s
/// option list expects (`on`/`off` for booleans, stringified otherwise).
#[derive(Debug, Clone, PartialEq)]
pub enum PluginOptionValue {
    Bool(bool),
    Text(String),
}

impl PluginOptionValue {
    fn render(&self) -> String {
        match self {
            PluginOptionValue::Bool(true) => "on".to_string(),
            PluginOptionValue::Bool(false) => "off".to_string(),
            PluginOptionValue::Text(s) => s.clone(),
        }
    }
}

/// Validated, immutable replication session configuration.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    pub conninfo: String,
    pub slot: String,
    pub start_position: Lsn,
    pub end_position: Lsn,
    pub timeline: Option<i64>,
    pub systemid: Option<String>,
    /// Caller-supplied `dbname`, if any. Not a reserved key: it stays in
    /// `conninfo` for the driver, and is also kept here so the bootstrapper
    /// can reconcile it against `IDENTIFY_SYSTEM`'s reported database.
    pub dbname: Option<String>,
    /// `None` means the caller left it unset: the effective cadence defers
    /// to the server's `wal_receiver_status_interval` GUC, resolved during
    /// bootstrap once a connection exists.
    pub status_interval: Option<Duration>,
    pub plugin_options: Vec<(String, PluginOptionValue)>,
}

impl ReplicatorConfig {
    /// Build from a named-option map. Recognized reserved keys are pulled
    /// out before the remainder is composed into a conninfo string.
    pub fn from_options(mut options: HashMap<String, String>) -> ReplicationResult<Self> {
        let slot = options
            .remove("slot")
            .ok_or_else(|| ReplicationError::config("missing required option: slot"))?;
        if slot.trim().is_empty() {
            return Err(ReplicationError::config("slot must not be empty"));
        }

        let start_position = Self::take_lsn_alias(&mut options, "start_position", "startpos")?
            .unwrap_or(Lsn::INVALID);
        let end_position = Self::take_lsn_alias(&mut options, "end_position", "endpos")?
            .unwrap_or(Lsn::INVALID);

        let timeline = match options.remove("timeline") {
            Some(v) if !v.is_empty() => Some(v.parse::<i64>().map_err(|_| {
                ReplicationError::config(format!("malformed timeline: {v:?}"))
            })?),
            _ => None,
        };

        let systemid = options
            .remove("systemid")
            .filter(|v| !v.is_empty());

        // `None` defers to the server's `wal_receiver_status_interval` GUC,
        // resolved once a connection exists (see bootstrap.rs). This config
        // parser never connects, so it cannot know that default itself.
        let status_interval = match options.remove("status_interval") {
            Some(v) if !v.is_empty() => {
                let secs = v.parse::<u64>().map_err(|_| {
                    ReplicationError::config(format!("malformed status_interval: {v:?}"))
                })?;
                if secs == 0 {
                    return Err(ReplicationError::config("status_interval must be positive"));
                }
                Some(Duration::from_secs(secs))
            }
            _ => None,
        };

        let plugin_options = options
            .remove("plugin_options")
            .map(|raw| Self::parse_plugin_options(&raw))
            .transpose()?
            .unwrap_or_default();

        let dbname = options.get("dbname").filter(|v| !v.is_empty()).cloned();

        // Drop remaining reserved keys defensively (aliases already consumed
        // above) and empty/absent top-level values, then hand the rest to
        // the driver as conninfo. `dbname` is a real libpq parameter, so it
        // is left in place rather than stripped.
        options.retain(|k, v| !RESERVED_KEYS.contains(&k.as_str()) && !v.is_empty());
        let conninfo = Self::compose_conninfo(options);

        Ok(Self {
            conninfo,
            slot,
            start_position,
            end_position,
            timeline,
            systemid,
            dbname,
            status_interval,
            plugin_options,
        })
    }

    /// Build from a libpq keyword/value conninfo string plus reserved keys
    /// embedded in it under the same names `from_options` recognizes.
    pub fn from_conninfo_str(conninfo: &str) -> ReplicationResult<Self> {
        Self::from_options(Self::split_conninfo(conninfo)?)
    }

    /// Load configuration from environment variables, for the example binary.
    pub fn from_env() -> ReplicationResult<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ReplicationError::config("missing DATABASE_URL environment variable"))?;
        let slot = env::var("SLOT_NAME")
            .map_err(|_| ReplicationError::config("missing SLOT_NAME environment variable"))?;

        let start_position = env::var("START_POSITION")
            .ok()
            .map(|s| s.parse::<Lsn>())
            .transpose()?
            .unwrap_or(Lsn::INVALID);
        let end_position = env::var("END_POSITION")
            .ok()
            .map(|s| s.parse::<Lsn>())
            .transpose()?
            .unwrap_or(Lsn::INVALID);
        let status_interval = env::var("STATUS_INTERVAL_SECS")
            .ok()
            .map(|s| {
                s.parse::<u64>()
                    .map_err(|_| ReplicationError::config("malformed STATUS_INTERVAL_SECS"))
            })
            .transpose()?
            .map(Duration::from_secs);

        Ok(Self {
            conninfo: Self::ensure_replication_database(&database_url),
            slot,
            start_position,
            end_position,
            timeline: None,
            systemid: None,
            dbname: None,
            status_interval,
            plugin_options: Vec::new(),
        })
    }

    fn take_lsn_alias(
        options: &mut HashMap<String, String>,
        primary: &str,
        alias: &str,
    ) -> ReplicationResult<Option<Lsn>> {
        let raw = options.remove(primary).or_else(|| options.remove(alias));
        match raw {
            Some(v) if !v.is_empty() => Ok(Some(v.parse::<Lsn>()?)),
            _ => Ok(None),
        }
    }

    /// `key1=val1,key2=true,...` -> ordered list of plugin options.
    fn parse_plugin_options(raw: &str) -> ReplicationResult<Vec<(String, PluginOptionValue)>> {
        raw.split(',')
            .filter(|pair| !pair.trim().is_empty())
            .map(|pair| {
                let (k, v) = pair.split_once('=').ok_or_else(|| {
                    ReplicationError::config(format!("malformed plugin option: {pair:?}"))
                })?;
                let value = match v {
                    "true" => PluginOptionValue::Bool(true),
                    "false" => PluginOptionValue::Bool(false),
                    other => PluginOptionValue::Text(other.to_string()),
                };
                Ok((k.trim().to_string(), value))
            })
            .collect()
    }

    fn split_conninfo(conninfo: &str) -> ReplicationResult<HashMap<String, String>> {
        let mut map = HashMap::new();
        for token in conninfo.split_whitespace() {
            let (k, v) = token.split_once('=').ok_or_else(|| {
                ReplicationError::config(format!("malformed conninfo token: {token:?}"))
            })?;
            map.insert(k.to_string(), v.trim_matches('\'').to_string());
        }
        Ok(map)
    }

    fn compose_conninfo(options: HashMap<String, String>) -> String {
        let mut parts: Vec<String> = options
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        parts.sort();
        if !parts.iter().any(|p| p.starts_with("replication=")) {
            parts.push("replication=database".to_string());
        }
        parts.join(" ")
    }

    fn ensure_replication_database(conninfo: &str) -> String {
        if conninfo.contains("replication=") {
            conninfo.to_string()
        } else if conninfo.contains('?') {
            format!("{conninfo}&replication=database")
        } else if conninfo.starts_with("postgres://") || conninfo.starts_with("postgresql://") {
            format!("{conninfo}?replication=database")
        } else {
            format!("{conninfo} replication=database")
        }
    }

    /// Render this config's plugin options as the `(opt 'val', ...)` clause
    /// of `START_REPLICATION`, quoting each key as an identifier via the
    /// driver's escaping helper.
    pub fn render_plugin_options<D: crate::driver::PgDriver>(
        &self,
        driver: &D,
    ) -> ReplicationResult<String> {
        if self.plugin_options.is_empty() {
            return Ok(String::new());
        }
        let mut rendered = Vec::with_capacity(self.plugin_options.len());
        for (key, value) in &self.plugin_options {
            let quoted_key = driver.escape_identifier(key)?;
            let quoted_val = driver.escape_literal(&value.render())?;
            rendered.push(format!("{quoted_key} {quoted_val}"));
        }
        Ok(format!(" ({})", rendered.join(", ")))
    }
}
