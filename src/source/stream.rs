//! Replication session
//!
//! Owns the walsender connection: system identification, slot creation and
//! reuse, entering COPY BOTH mode, parsing the outer streaming-replication
//! frames, and sending standby status updates that carry the acknowledged
//! position back to the server.

use crate::config::BridgeConfig;
use crate::errors::{BridgeError, BridgeResult};
use crate::source::connection::{CopyData, PgConnection};
use crate::source::{Frame, StreamTransport};
use crate::types::{Lsn, format_lsn, parse_lsn};
use libpq_sys::ExecStatusType;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// SQLSTATE reported when the replication slot already exists.
const DUPLICATE_OBJECT: &str = "42710";

/// Seconds between the Unix and PostgreSQL epochs (2000-01-01).
const POSTGRES_EPOCH_OFFSET_SECS: i64 = 946_684_800;

pub struct PgReplicationStream {
    conn: PgConnection,
    slot_name: String,
    publication: String,
    slot_created: bool,
    snapshot_name: Option<String>,
    consistent_point: Lsn,
    received_lsn: Lsn,
    streaming: bool,
}

impl PgReplicationStream {
    /// Opens a walsender connection to the configured server.
    pub fn connect(config: &BridgeConfig) -> BridgeResult<Self> {
        let conninfo = add_replication_option(&config.conninfo);
        info!("connecting to database server for replication");
        let conn = PgConnection::connect(&conninfo)?;

        Ok(Self {
            conn,
            slot_name: config.slot_name.clone(),
            publication: config.publication.clone(),
            slot_created: false,
            snapshot_name: None,
            consistent_point: 0,
            received_lsn: 0,
            streaming: false,
        })
    }

    /// Verifies the connection supports replication commands.
    pub fn identify_system(&self) -> BridgeResult<()> {
        let result = self.conn.exec_ok("IDENTIFY_SYSTEM")?;
        info!(
            "system identified: id {:?}, timeline {:?}, xlogpos {:?}",
            result.getvalue(0, 0),
            result.getvalue(0, 1),
            result.getvalue(0, 2)
        );
        Ok(())
    }

    /// Creates the replication slot, exporting a snapshot for the initial
    /// copy. An already-existing slot is reused, in which case the server
    /// resumes from its confirmed position and no snapshot is taken.
    pub fn create_slot(&mut self) -> BridgeResult<()> {
        let sql = format!(
            "CREATE_REPLICATION_SLOT \"{}\" LOGICAL pgoutput EXPORT_SNAPSHOT",
            self.slot_name
        );
        let result = self.conn.exec(&sql)?;

        if result.is_ok() {
            self.slot_created = true;
            self.consistent_point = result
                .getvalue(0, 1)
                .as_deref()
                .and_then(parse_lsn)
                .unwrap_or(0);
            self.snapshot_name = result.getvalue(0, 2).filter(|name| !name.is_empty());
            info!(
                "created replication slot \"{}\", consistent point {}",
                self.slot_name,
                format_lsn(self.consistent_point)
            );
            return Ok(());
        }

        if result.sqlstate().as_deref() == Some(DUPLICATE_OBJECT) {
            info!(
                "replication slot \"{}\" exists, resuming from its confirmed position",
                self.slot_name
            );
            return Ok(());
        }

        Err(BridgeError::protocol(format!(
            "could not create replication slot \"{}\": {}",
            self.slot_name,
            self.conn.last_error()
        )))
    }

    /// True when this run created the slot (and may own a pending snapshot).
    pub fn slot_created(&self) -> bool {
        self.slot_created
    }

    /// Name of the exported snapshot, when one is pending.
    pub fn snapshot_name(&self) -> Option<&str> {
        self.snapshot_name.as_deref()
    }

    /// WAL position at which the newly created slot becomes consistent.
    pub fn consistent_point(&self) -> Lsn {
        self.consistent_point
    }

    /// Drops the replication slot over a fresh connection. Used when a
    /// failed snapshot must be retried from scratch on the next run.
    pub fn drop_slot(config: &BridgeConfig) -> BridgeResult<()> {
        let conn = PgConnection::connect(&add_replication_option(&config.conninfo))?;
        conn.exec_ok(&format!("DROP_REPLICATION_SLOT \"{}\"", config.slot_name))?;
        Ok(())
    }
}

impl StreamTransport for PgReplicationStream {
    fn begin_streaming(&mut self) -> BridgeResult<()> {
        let sql = format!(
            "START_REPLICATION SLOT \"{}\" LOGICAL 0/0 (proto_version '1', publication_names '\"{}\"')",
            self.slot_name, self.publication
        );
        let result = self.conn.exec(&sql)?;
        if result.status() != ExecStatusType::PGRES_COPY_BOTH {
            return Err(BridgeError::protocol(format!(
                "failed to start replication: {}",
                self.conn.last_error()
            )));
        }

        self.streaming = true;
        info!(
            "streaming changes for publication \"{}\" through slot \"{}\"",
            self.publication, self.slot_name
        );
        Ok(())
    }

    fn poll_frame(&mut self) -> BridgeResult<Option<Frame>> {
        if !self.streaming {
            return Ok(None);
        }

        match self.conn.get_copy_data()? {
            CopyData::WouldBlock => Ok(None),
            CopyData::Done => Err(BridgeError::connection(
                "replication stream closed by server",
            )),
            CopyData::Row(data) => {
                let frame = parse_frame(&data)?;
                match &frame {
                    Some(Frame::Keepalive { wal_end, .. }) => {
                        self.received_lsn = self.received_lsn.max(*wal_end);
                    }
                    Some(Frame::XLogData { wal_start, .. }) => {
                        self.received_lsn = self.received_lsn.max(*wal_start);
                    }
                    None => {}
                }
                Ok(frame)
            }
        }
    }

    fn wait_readable(&mut self, timeout: Duration) -> BridgeResult<()> {
        self.conn.wait_readable(timeout)
    }

    fn send_status_update(&mut self, fsync_lsn: Lsn) -> BridgeResult<()> {
        // Before COPY BOTH mode there is nothing to report and nowhere to
        // report it.
        if !self.streaming {
            return Ok(());
        }

        let mut reply = Vec::with_capacity(34);
        reply.push(b'r');
        reply.extend_from_slice(&self.received_lsn.to_be_bytes());
        reply.extend_from_slice(&fsync_lsn.to_be_bytes());
        reply.extend_from_slice(&fsync_lsn.to_be_bytes());
        reply.extend_from_slice(&pg_timestamp_now().to_be_bytes());
        reply.push(0);

        self.conn.put_copy_data(&reply)?;
        self.conn.flush()?;
        debug!(
            "sent status update: received {}, fsync {}",
            format_lsn(self.received_lsn),
            format_lsn(fsync_lsn)
        );
        Ok(())
    }
}

/// Parses one outer replication frame. Unknown frame types are skipped with
/// a warning, matching the server's forward-compatibility expectations.
fn parse_frame(data: &[u8]) -> BridgeResult<Option<Frame>> {
    if data.is_empty() {
        return Ok(None);
    }

    match data[0] {
        b'k' => {
            if data.len() < 18 {
                return Err(BridgeError::protocol("keepalive message too short"));
            }
            let wal_end = read_u64(&data[1..9]);
            let reply_requested = data[17] != 0;
            Ok(Some(Frame::Keepalive {
                wal_end,
                reply_requested,
            }))
        }
        b'w' => {
            if data.len() < 25 {
                return Err(BridgeError::protocol("XLogData message too short"));
            }
            let wal_start = read_u64(&data[1..9]);
            Ok(Some(Frame::XLogData {
                wal_start,
                data: data[25..].to_vec(),
            }))
        }
        other => {
            warn!("received unknown replication frame type: {}", other as char);
            Ok(None)
        }
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(raw)
}

/// Microseconds since the PostgreSQL epoch, as expected in status updates.
fn pg_timestamp_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since_unix) => since_unix.as_micros() as i64 - POSTGRES_EPOCH_OFFSET_SECS * 1_000_000,
        Err(_) => 0,
    }
}

/// Replication commands need `replication=database` on the connection; it is
/// appended in whichever form the conninfo uses.
fn add_replication_option(conninfo: &str) -> String {
    if conninfo.contains("://") {
        if conninfo.contains('?') {
            format!("{conninfo}&replication=database")
        } else {
            format!("{conninfo}?replication=database")
        }
    } else {
        format!("{conninfo} replication=database")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_replication_option() {
        assert_eq!(
            add_replication_option("host=localhost dbname=test"),
            "host=localhost dbname=test replication=database"
        );
        assert_eq!(
            add_replication_option("postgres://localhost/test"),
            "postgres://localhost/test?replication=database"
        );
        assert_eq!(
            add_replication_option("postgres://localhost/test?sslmode=disable"),
            "postgres://localhost/test?sslmode=disable&replication=database"
        );
    }

    #[test]
    fn test_parse_keepalive_frame() {
        let mut data = vec![b'k'];
        data.extend_from_slice(&0x200u64.to_be_bytes());
        data.extend_from_slice(&0i64.to_be_bytes());
        data.push(1);

        match parse_frame(&data).unwrap() {
            Some(Frame::Keepalive {
                wal_end,
                reply_requested,
            }) => {
                assert_eq!(wal_end, 0x200);
                assert!(reply_requested);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_xlogdata_frame() {
        let mut data = vec![b'w'];
        data.extend_from_slice(&0x108u64.to_be_bytes());
        data.extend_from_slice(&0x200u64.to_be_bytes());
        data.extend_from_slice(&0i64.to_be_bytes());
        data.extend_from_slice(b"payload");

        match parse_frame(&data).unwrap() {
            Some(Frame::XLogData { wal_start, data }) => {
                assert_eq!(wal_start, 0x108);
                assert_eq!(data, b"payload");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_short_frames_are_errors() {
        assert!(parse_frame(&[b'k', 0, 0]).is_err());
        assert!(parse_frame(&[b'w', 0]).is_err());
    }

    #[test]
    fn test_unknown_frame_is_skipped() {
        assert_eq!(parse_frame(&[b'q', 1, 2, 3]).unwrap(), None);
        assert_eq!(parse_frame(&[]).unwrap(), None);
    }

    #[test]
    fn test_pg_timestamp_is_after_epoch() {
        assert!(pg_timestamp_now() > 0);
    }
}
