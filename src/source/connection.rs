//! PostgreSQL connection handling
//!
//! A safe wrapper around libpq for the replication and snapshot connections.
//! Reads from the COPY stream are non-blocking so the supervisor can
//! alternate between upstream and producer polling without stalling either
//! side.

use crate::errors::{BridgeError, BridgeResult};
use libpq_sys::*;
use std::ffi::{CStr, CString};
use std::ptr;
use std::time::Duration;

/// Outcome of a non-blocking COPY read.
pub enum CopyData {
    /// One complete frame.
    Row(Vec<u8>),
    /// The stream is open but no complete frame is buffered yet.
    WouldBlock,
    /// The server ended the COPY.
    Done,
}

/// Safe wrapper for a libpq connection.
pub struct PgConnection {
    conn: *mut PGconn,
}

impl PgConnection {
    /// Connects using the provided conninfo string or URI.
    pub fn connect(conninfo: &str) -> BridgeResult<Self> {
        let c_conninfo = CString::new(conninfo)?;
        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };

        if conn.is_null() {
            return Err(BridgeError::connection(
                "failed to allocate connection object",
            ));
        }

        let status = unsafe { PQstatus(conn) };
        if status != ConnStatusType::CONNECTION_OK {
            let message = connection_error(conn);
            unsafe { PQfinish(conn) };
            return Err(BridgeError::connection(format!(
                "connection failed: {message}"
            )));
        }

        Ok(Self { conn })
    }

    /// Executes a query and returns the result wrapper. SQL-level failures
    /// are reported through the result's status, not as an `Err`.
    pub fn exec(&self, query: &str) -> BridgeResult<PgQueryResult> {
        let c_query = CString::new(query)?;
        let result = unsafe { PQexec(self.conn, c_query.as_ptr()) };

        if result.is_null() {
            return Err(BridgeError::protocol(format!(
                "query execution failed: {}",
                self.last_error()
            )));
        }

        Ok(PgQueryResult { result })
    }

    /// Executes a query and requires a successful status.
    pub fn exec_ok(&self, query: &str) -> BridgeResult<PgQueryResult> {
        let result = self.exec(query)?;
        if !result.is_ok() {
            return Err(BridgeError::protocol(format!(
                "query \"{query}\" failed: {}",
                self.last_error()
            )));
        }
        Ok(result)
    }

    /// Non-blocking read of one frame from the COPY stream.
    pub fn get_copy_data(&self) -> BridgeResult<CopyData> {
        if unsafe { PQconsumeInput(self.conn) } != 1 {
            return Err(BridgeError::connection(self.last_error()));
        }

        let mut buffer: *mut std::os::raw::c_char = ptr::null_mut();
        let len = unsafe { PQgetCopyData(self.conn, &mut buffer, 1) };

        match len {
            -2 => Err(BridgeError::protocol(self.last_error())),
            -1 => {
                // Collect the final command status of the COPY.
                let result = PgQueryResult {
                    result: unsafe { PQgetResult(self.conn) },
                };
                if !result.result.is_null() && !result.is_ok() {
                    return Err(BridgeError::protocol(self.last_error()));
                }
                Ok(CopyData::Done)
            }
            0 => Ok(CopyData::WouldBlock),
            len => {
                if buffer.is_null() {
                    return Err(BridgeError::protocol("received null COPY buffer"));
                }
                let data = unsafe {
                    std::slice::from_raw_parts(buffer as *const u8, len as usize).to_vec()
                };
                unsafe { PQfreemem(buffer as *mut std::os::raw::c_void) };
                Ok(CopyData::Row(data))
            }
        }
    }

    /// Sends data on the COPY stream.
    pub fn put_copy_data(&self, data: &[u8]) -> BridgeResult<()> {
        let result = unsafe {
            PQputCopyData(
                self.conn,
                data.as_ptr() as *const std::os::raw::c_char,
                data.len() as i32,
            )
        };

        if result != 1 {
            return Err(BridgeError::protocol(format!(
                "failed to send copy data: {}",
                self.last_error()
            )));
        }
        Ok(())
    }

    /// Flushes buffered output to the server.
    pub fn flush(&self) -> BridgeResult<()> {
        if unsafe { PQflush(self.conn) } != 0 {
            return Err(BridgeError::protocol("failed to flush connection"));
        }
        Ok(())
    }

    /// Blocks until the connection socket is readable or the timeout
    /// elapses.
    pub fn wait_readable(&self, timeout: Duration) -> BridgeResult<()> {
        let socket = unsafe { PQsocket(self.conn) };
        if socket < 0 {
            return Err(BridgeError::connection("connection has no socket"));
        }

        let mut pollfd = libc::pollfd {
            fd: socket,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout.as_millis() as i32) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            // A signal interrupting the wait is handled by the caller's
            // shutdown check.
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(BridgeError::Io(err));
        }
        Ok(())
    }

    /// Most recent error message reported by libpq.
    pub fn last_error(&self) -> String {
        connection_error(self.conn)
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if !self.conn.is_null() {
            unsafe { PQfinish(self.conn) };
        }
    }
}

fn connection_error(conn: *const PGconn) -> String {
    unsafe {
        let error_ptr = PQerrorMessage(conn);
        if error_ptr.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(error_ptr).to_string_lossy().trim().to_string()
        }
    }
}

/// Safe wrapper for a query result.
pub struct PgQueryResult {
    result: *mut PGresult,
}

impl PgQueryResult {
    pub fn status(&self) -> ExecStatusType {
        unsafe { PQresultStatus(self.result) }
    }

    pub fn is_ok(&self) -> bool {
        matches!(
            self.status(),
            ExecStatusType::PGRES_TUPLES_OK | ExecStatusType::PGRES_COMMAND_OK
        )
    }

    pub fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.result) }
    }

    pub fn nfields(&self) -> i32 {
        unsafe { PQnfields(self.result) }
    }

    pub fn is_null(&self, row: i32, col: i32) -> bool {
        unsafe { PQgetisnull(self.result, row, col) == 1 }
    }

    pub fn getvalue(&self, row: i32, col: i32) -> Option<String> {
        let value_ptr = unsafe { PQgetvalue(self.result, row, col) };
        if value_ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(value_ptr).to_string_lossy().into_owned()) }
        }
    }

    /// The SQLSTATE of a failed command, e.g. `42710` for duplicate_object.
    pub fn sqlstate(&self) -> Option<String> {
        // PG_DIAG_SQLSTATE == 'C'
        let field = unsafe { PQresultErrorField(self.result, 'C' as i32) };
        if field.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(field).to_string_lossy().into_owned()) }
        }
    }
}

impl Drop for PgQueryResult {
    fn drop(&mut self) {
        if !self.result.is_null() {
            unsafe { PQclear(self.result) };
        }
    }
}
