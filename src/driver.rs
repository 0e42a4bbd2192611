//! The PostgreSQL connection collaborator.
//!
//! A trait abstracting the PostgreSQL frontend/backend protocol operations
//! the replication session needs, plus a `libpq`-backed implementation
//! covering non-blocking COPY operations, parameter/version introspection,
//! the raw socket handle, and the quoting helpers the session bootstrapper
//! and stream loop require.

use crate::errors::{ReplicationError, ReplicationResult};
use libpq_sys::*;
use std::ffi::{CStr, CString};
use std::os::raw::c_int;
use std::ptr;

/// Outcome of a non-blocking `get_copy_data` poll.
pub enum CopyData {
    /// A full CopyData row was available.
    Row(Vec<u8>),
    /// COPY is still in progress, but no complete row is available yet.
    WouldBlock,
    /// The COPY stream ended; the final command result has been drained.
    Done,
}

/// Read-only access to a completed query result.
pub trait PgResult {
    fn is_ok(&self) -> bool;
    fn is_copy_both(&self) -> bool;
    fn ntuples(&self) -> i32;
    fn getvalue(&self, row: i32, col: i32) -> Option<String>;
    fn status_debug(&self) -> String;
}

/// The operations the replication session needs from a PostgreSQL connection.
///
/// Modeled after libpq: a result is always a terminal value (no streaming
/// result sets), COPY operations are explicit, and the caller owns flow
/// control around non-blocking reads.
pub trait PgDriver {
    type Result: PgResult;

    fn is_healthy(&self) -> bool;
    fn error_message(&self) -> String;
    fn server_version(&self) -> i32;
    fn parameter_status(&self, name: &str) -> Option<String>;
    /// Reads back the *effective* value libpq resolved for a connection
    /// parameter (e.g. `replication`), including values filled in from
    /// defaults rather than supplied verbatim in conninfo.
    fn conninfo_parameter(&self, keyword: &str) -> ReplicationResult<Option<String>>;
    fn socket_fd(&self) -> i32;

    fn exec(&self, query: &str) -> ReplicationResult<Self::Result>;

    fn consume_input(&self) -> ReplicationResult<()>;
    fn is_busy(&self) -> bool;
    fn get_copy_data(&self) -> ReplicationResult<CopyData>;
    fn put_copy_data(&self, data: &[u8]) -> ReplicationResult<()>;
    fn flush(&self) -> ReplicationResult<()>;
    fn get_last_result(&self) -> ReplicationResult<Self::Result>;

    fn escape_identifier(&self, s: &str) -> ReplicationResult<String>;
    fn escape_literal(&self, s: &str) -> ReplicationResult<String>;

    /// Idempotent: closing an already-closed driver is a no-op.
    fn close(&mut self);
}

/// Safe wrapper around a `libpq` connection opened in replication mode.
pub struct LibpqDriver {
    conn: *mut PGconn,
}

// libpq connections are not implicitly thread-safe for concurrent use, but a
// single `LibpqDriver` is only ever driven by one stream loop at a time; the
// handle itself is safe to hand across threads between uses.
unsafe impl Send for LibpqDriver {}

impl LibpqDriver {
    /// Opens a connection with libpq's `PQconnectdb`. Callers are
    /// responsible for ensuring `conninfo` carries `replication=database`.
    pub fn connect(conninfo: &str) -> ReplicationResult<Self> {
        let c_conninfo = CString::new(conninfo)?;
        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };
        if conn.is_null() {
            return Err(ReplicationError::connection(
                "failed to allocate connection object",
            ));
        }

        let driver = Self { conn };
        if !driver.is_healthy() {
            let msg = driver.error_message();
            return Err(ReplicationError::connection(format!(
                "connection failed: {msg}"
            )));
        }
        Ok(driver)
    }

    fn raw_error_message(conn: *const PGconn) -> String {
        unsafe {
            let ptr = PQerrorMessage(conn);
            if ptr.is_null() {
                "unknown error".to_string()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        }
    }
}

impl PgDriver for LibpqDriver {
    type Result = LibpqResult;

    fn is_healthy(&self) -> bool {
        unsafe { PQstatus(self.conn) == ConnStatusType::CONNECTION_OK }
    }

    fn error_message(&self) -> String {
        Self::raw_error_message(self.conn)
    }

    fn server_version(&self) -> i32 {
        unsafe { PQserverVersion(self.conn) }
    }

    fn parameter_status(&self, name: &str) -> Option<String> {
        let c_name = CString::new(name).ok()?;
        unsafe {
            let ptr = PQparameterStatus(self.conn, c_name.as_ptr());
            if ptr.is_null() {
                None
            } else {
                Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
            }
        }
    }

    fn conninfo_parameter(&self, keyword: &str) -> ReplicationResult<Option<String>> {
        let options = unsafe { PQconninfo(self.conn) };
        if options.is_null() {
            return Err(ReplicationError::connection(
                "failed to read back connection parameters",
            ));
        }
        let found = unsafe {
            let mut cursor = options;
            let mut found = None;
            while !(*cursor).keyword.is_null() {
                let kw = CStr::from_ptr((*cursor).keyword).to_string_lossy();
                if kw == keyword {
                    found = if (*cursor).val.is_null() {
                        None
                    } else {
                        Some(CStr::from_ptr((*cursor).val).to_string_lossy().into_owned())
                    };
                    break;
                }
                cursor = cursor.add(1);
            }
            found
        };
        unsafe { PQconninfoFree(options) };
        Ok(found)
    }

    fn socket_fd(&self) -> i32 {
        unsafe { PQsocket(self.conn) }
    }

    fn exec(&self, query: &str) -> ReplicationResult<Self::Result> {
        let c_query = CString::new(query)?;
        let result = unsafe { PQexec(self.conn, c_query.as_ptr()) };
        if result.is_null() {
            return Err(ReplicationError::protocol(format!(
                "query execution failed: {}",
                self.error_message()
            )));
        }
        Ok(LibpqResult { result })
    }

    fn consume_input(&self) -> ReplicationResult<()> {
        let ok = unsafe { PQconsumeInput(self.conn) };
        if ok != 1 {
            return Err(ReplicationError::protocol(format!(
                "consume_input failed: {}",
                self.error_message()
            )));
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        unsafe { PQisBusy(self.conn) == 1 }
    }

    fn get_copy_data(&self) -> ReplicationResult<CopyData> {
        let mut buffer: *mut std::os::raw::c_char = ptr::null_mut();
        let len = unsafe { PQgetCopyData(self.conn, &mut buffer, 1) };
        match len {
            -2 => Err(ReplicationError::protocol(self.error_message())),
            -1 => {
                let result = self.get_last_result()?;
                if !result.is_ok() {
                    return Err(ReplicationError::protocol(format!(
                        "unexpected final result after COPY end: {}",
                        result.status_debug()
                    )));
                }
                Ok(CopyData::Done)
            }
            0 => Ok(CopyData::WouldBlock),
            n => {
                if buffer.is_null() {
                    return Err(ReplicationError::buffer("received null COPY buffer"));
                }
                let data =
                    unsafe { std::slice::from_raw_parts(buffer as *const u8, n as usize).to_vec() };
                unsafe { PQfreemem(buffer as *mut std::os::raw::c_void) };
                Ok(CopyData::Row(data))
            }
        }
    }

    fn put_copy_data(&self, data: &[u8]) -> ReplicationResult<()> {
        let result = unsafe {
            PQputCopyData(
                self.conn,
                data.as_ptr() as *const std::os::raw::c_char,
                data.len() as c_int,
            )
        };
        if result != 1 {
            return Err(ReplicationError::protocol(format!(
                "failed to send COPY data: {}",
                self.error_message()
            )));
        }
        Ok(())
    }

    fn flush(&self) -> ReplicationResult<()> {
        let result = unsafe { PQflush(self.conn) };
        if result != 0 {
            return Err(ReplicationError::protocol(format!(
                "failed to flush connection: {}",
                self.error_message()
            )));
        }
        Ok(())
    }

    fn get_last_result(&self) -> ReplicationResult<Self::Result> {
        let result = unsafe { PQgetResult(self.conn) };
        Ok(LibpqResult { result })
    }

    fn escape_identifier(&self, s: &str) -> ReplicationResult<String> {
        let c_s = CString::new(s)?;
        unsafe {
            let ptr = PQescapeIdentifier(self.conn, c_s.as_ptr(), s.len());
            if ptr.is_null() {
                return Err(ReplicationError::protocol(format!(
                    "failed to quote identifier {s:?}: {}",
                    self.error_message()
                )));
            }
            let quoted = CStr::from_ptr(ptr).to_string_lossy().into_owned();
            PQfreemem(ptr as *mut std::os::raw::c_void);
            Ok(quoted)
        }
    }

    fn escape_literal(&self, s: &str) -> ReplicationResult<String> {
        // PQescapeLiteral is preferred over PQescapeStringConn: it returns an
        // already-quoted, E''-prefixed-if-needed literal ready to splice in.
        let c_s = CString::new(s)?;
        unsafe {
            let ptr = PQescapeLiteral(self.conn, c_s.as_ptr(), s.len());
            if ptr.is_null() {
                return Err(ReplicationError::protocol(format!(
                    "failed to quote literal {s:?}: {}",
                    self.error_message()
                )));
            }
            let quoted = CStr::from_ptr(ptr).to_string_lossy().into_owned();
            PQfreemem(ptr as *mut std::os::raw::c_void);
            Ok(quoted)
        }
    }

    fn close(&mut self) {
        if !self.conn.is_null() {
            unsafe { PQfinish(self.conn) };
            self.conn = ptr::null_mut();
        }
    }
}

impl Drop for LibpqDriver {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct LibpqResult {
    result: *mut PGresult,
}

impl PgResult for LibpqResult {
    fn is_ok(&self) -> bool {
        matches!(
            unsafe { PQresultStatus(self.result) },
            ExecStatusType::PGRES_TUPLES_OK | ExecStatusType::PGRES_COMMAND_OK
        )
    }

    fn is_copy_both(&self) -> bool {
        unsafe { PQresultStatus(self.result) == ExecStatusType::PGRES_COPY_BOTH }
    }

    fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.result) }
    }

    fn getvalue(&self, row: i32, col: i32) -> Option<String> {
        unsafe {
            let ptr = PQgetvalue(self.result, row, col);
            if ptr.is_null() {
                None
            } else {
                Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
            }
        }
    }

    fn status_debug(&self) -> String {
        format!("{:?}", unsafe { PQresultStatus(self.result) })
    }
}

impl Drop for LibpqResult {
    fn drop(&mut self) {
        if !self.result.is_null() {
            unsafe { PQclear(self.result) };
        }
    }
}

/// Wait for the driver's socket to become readable, bounded by `timeout`.
/// Used by the stream loop's socket wait between COPY drains.
pub fn wait_readable(fd: i32, timeout: std::time::Duration) -> ReplicationResult<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if rc < 0 {
        return Err(ReplicationError::Io(std::io::Error::last_os_error()));
    }
    Ok(rc > 0 && pollfd.revents & libc::POLLIN != 0)
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock;
