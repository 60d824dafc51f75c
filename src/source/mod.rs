//! Upstream replication source
//!
//! Everything that faces the PostgreSQL end of the bridge: the libpq
//! connection wrapper, the replication session (slot management, outer frame
//! protocol, standby status updates), the pgoutput message parser, generated
//! schemas and row materialisation, and the initial snapshot export.
//!
//! The pipeline consumes this layer through two narrow contracts defined
//! here: [`ChangeHandler`], the event callbacks the decoder drives, and
//! [`StreamTransport`], the frame-level operations the supervisor drives.

pub mod connection;
pub mod decoder;
pub mod parser;
pub mod schema;
pub mod snapshot;
pub mod stream;

use crate::errors::BridgeResult;
use crate::types::{Lsn, Oid, SyncStatus, Xid};
use std::time::Duration;

/// Event callbacks through which decoded upstream changes enter the
/// pipeline.
///
/// Callbacks return a `BridgeResult` instead of unwinding: the decoder
/// cannot cleanly abort mid-frame, so it propagates the status and the
/// supervisor acts on it once control returns.
pub trait ChangeHandler {
    /// A transaction started. Xid 0 is the initial snapshot and is only
    /// legal as the very first transaction.
    fn on_begin(&mut self, xid: Xid, wal_pos: Lsn) -> BridgeResult<()>;

    /// The current transaction committed at `wal_pos`.
    fn on_commit(&mut self, xid: Xid, wal_pos: Lsn) -> BridgeResult<()>;

    /// Schema information for a relation, as generated schema texts. The key
    /// schema is absent for tables without a replica identity key.
    fn on_table_schema(
        &mut self,
        relid: Oid,
        key_schema: Option<&str>,
        value_schema: &str,
        wal_pos: Lsn,
    ) -> BridgeResult<()>;

    /// A row was inserted.
    fn on_insert(
        &mut self,
        relid: Oid,
        key: Option<&[u8]>,
        value: &[u8],
        wal_pos: Lsn,
    ) -> BridgeResult<()>;

    /// A row was updated. `old` carries the previous row image when the
    /// table's replica identity provides one.
    fn on_update(
        &mut self,
        relid: Oid,
        key: Option<&[u8]>,
        old: Option<&[u8]>,
        new: &[u8],
        wal_pos: Lsn,
    ) -> BridgeResult<()>;

    /// A row was deleted. The key is absent for unkeyed tables.
    fn on_delete(
        &mut self,
        relid: Oid,
        key: Option<&[u8]>,
        old: Option<&[u8]>,
        wal_pos: Lsn,
    ) -> BridgeResult<()>;

    /// The server sent a keepalive. `SyncPending` tells the transport not to
    /// advance the acknowledged position past in-flight data.
    fn on_keepalive(&mut self, wal_pos: Lsn) -> BridgeResult<SyncStatus>;

    /// The upstream client reported a recoverable error.
    fn on_source_error(&mut self, message: &str) -> BridgeResult<()>;

    /// The WAL position up to which data is durable downstream; reported to
    /// the server in status updates.
    fn acknowledged_lsn(&self) -> Lsn;
}

/// One frame of the outer streaming-replication protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Server keepalive ('k'); `reply_requested` asks for an immediate
    /// standby status update.
    Keepalive { wal_end: Lsn, reply_requested: bool },
    /// XLogData ('w') carrying one pgoutput message.
    XLogData { wal_start: Lsn, data: Vec<u8> },
}

/// Frame-level operations on the replication connection.
pub trait StreamTransport {
    /// Enters COPY BOTH mode. Called once, after any snapshot completed.
    fn begin_streaming(&mut self) -> BridgeResult<()>;

    /// Non-blocking poll for the next frame; `None` when the server has
    /// nothing buffered.
    fn poll_frame(&mut self) -> BridgeResult<Option<Frame>>;

    /// Blocks until the connection is readable or the timeout elapses.
    fn wait_readable(&mut self, timeout: Duration) -> BridgeResult<()>;

    /// Sends a standby status update carrying the acknowledged position,
    /// without consuming any upstream data. Keeps the connection alive
    /// during backpressure.
    fn send_status_update(&mut self, fsync_lsn: Lsn) -> BridgeResult<()>;
}
