//! An in-memory `PgDriver` used by the property and bootstrap tests.
//!
//! Scripts canned query responses and a queue of COPY frames so the stream
//! loop and session bootstrapper can be exercised without a live server.

use super::{CopyData, PgDriver, PgResult};
use crate::errors::{ReplicationError, ReplicationResult};
use std::cell::RefCell;
use std::collections::VecDeque;

#[derive(Clone, Default)]
pub struct MockResult {
    pub ok: bool,
    pub copy_both: bool,
    pub rows: Vec<Vec<String>>,
}

impl PgResult for MockResult {
    fn is_ok(&self) -> bool {
        self.ok
    }

    fn is_copy_both(&self) -> bool {
        self.copy_both
    }

    fn ntuples(&self) -> i32 {
        self.rows.len() as i32
    }

    fn getvalue(&self, row: i32, col: i32) -> Option<String> {
        self.rows
            .get(row as usize)
            .and_then(|r| r.get(col as usize))
            .cloned()
    }

    fn status_debug(&self) -> String {
        format!("MockResult(ok={}, copy_both={})", self.ok, self.copy_both)
    }
}

pub struct MockDriver {
    pub healthy: bool,
    pub server_version: i32,
    pub parameters: std::collections::HashMap<String, String>,
    /// Effective connection parameters, as a real driver's conninfo
    /// round-trip would report them. Defaults to `replication=database` so
    /// tests that don't care about this check keep passing.
    pub conninfo_params: std::collections::HashMap<String, String>,
    /// Exact-match query -> canned result. Unmatched queries return `default_exec_result`.
    pub responses: std::collections::HashMap<String, MockResult>,
    pub default_exec_result: MockResult,
    pub copy_queue: RefCell<VecDeque<CopyData>>,
    pub sent: RefCell<Vec<Vec<u8>>>,
    pub closed: RefCell<bool>,
    pub last_query: RefCell<Option<String>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self {
            healthy: true,
            server_version: 150000,
            parameters: std::collections::HashMap::new(),
            conninfo_params: [("replication".to_string(), "database".to_string())].into(),
            responses: std::collections::HashMap::new(),
            default_exec_result: MockResult {
                ok: true,
                copy_both: false,
                rows: vec![],
            },
            copy_queue: RefCell::new(VecDeque::new()),
            sent: RefCell::new(Vec::new()),
            closed: RefCell::new(false),
            last_query: RefCell::new(None),
        }
    }
}

impl MockDriver {
    pub fn with_identify_system(mut self, systemid: &str, timeline: &str, dbname: &str) -> Self {
        self.responses.insert(
            "IDENTIFY_SYSTEM".to_string(),
            MockResult {
                ok: true,
                copy_both: false,
                rows: vec![vec![
                    systemid.to_string(),
                    timeline.to_string(),
                    dbname.to_string(),
                ]],
            },
        );
        self
    }

    pub fn with_integer_datetimes(mut self, on: bool) -> Self {
        self.parameters.insert(
            "integer_datetimes".to_string(),
            if on { "on" } else { "off" }.to_string(),
        );
        self
    }

    pub fn push_copy(&self, frame: CopyData) {
        self.copy_queue.borrow_mut().push_back(frame);
    }

    pub fn with_conninfo_param(mut self, keyword: &str, value: &str) -> Self {
        self.conninfo_params
            .insert(keyword.to_string(), value.to_string());
        self
    }
}

impl PgDriver for MockDriver {
    type Result = MockResult;

    fn is_healthy(&self) -> bool {
        self.healthy
    }

    fn error_message(&self) -> String {
        "mock error".to_string()
    }

    fn server_version(&self) -> i32 {
        self.server_version
    }

    fn parameter_status(&self, name: &str) -> Option<String> {
        self.parameters.get(name).cloned()
    }

    fn conninfo_parameter(&self, keyword: &str) -> ReplicationResult<Option<String>> {
        Ok(self.conninfo_params.get(keyword).cloned())
    }

    fn socket_fd(&self) -> i32 {
        -1
    }

    fn exec(&self, query: &str) -> ReplicationResult<Self::Result> {
        *self.last_query.borrow_mut() = Some(query.to_string());
        if query.starts_with("START_REPLICATION") {
            return Ok(self
                .responses
                .get("START_REPLICATION")
                .cloned()
                .unwrap_or(MockResult {
                    ok: true,
                    copy_both: true,
                    rows: vec![],
                }));
        }
        Ok(self
            .responses
            .get(query)
            .cloned()
            .unwrap_or_else(|| self.default_exec_result.clone()))
    }

    fn consume_input(&self) -> ReplicationResult<()> {
        Ok(())
    }

    fn is_busy(&self) -> bool {
        false
    }

    fn get_copy_data(&self) -> ReplicationResult<CopyData> {
        match self.copy_queue.borrow_mut().pop_front() {
            Some(CopyData::Row(bytes)) => Ok(CopyData::Row(bytes)),
            Some(CopyData::WouldBlock) => Ok(CopyData::WouldBlock),
            Some(CopyData::Done) => Ok(CopyData::Done),
            None => Ok(CopyData::WouldBlock),
        }
    }

    fn put_copy_data(&self, data: &[u8]) -> ReplicationResult<()> {
        self.sent.borrow_mut().push(data.to_vec());
        Ok(())
    }

    fn flush(&self) -> ReplicationResult<()> {
        Ok(())
    }

    fn get_last_result(&self) -> ReplicationResult<Self::Result> {
        Ok(MockResult {
            ok: true,
            copy_both: false,
            rows: vec![],
        })
    }

    fn escape_identifier(&self, s: &str) -> ReplicationResult<String> {
        if s.is_empty() {
            return Err(ReplicationError::protocol("cannot quote empty identifier"));
        }
        Ok(format!("\"{}\"", s.replace('"', "\"\"")))
    }

    fn escape_literal(&self, s: &str) -> ReplicationResult<String> {
        Ok(format!("'{}'", s.replace('\'', "''")))
    }

    fn close(&mut self) {
        *self.closed.borrow_mut() = true;
    }
}
