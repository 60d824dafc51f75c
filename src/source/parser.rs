//! pgoutput logical replication message parser
//!
//! Parses the payload of XLogData frames into typed messages. The stream is
//! negotiated at protocol version 1 without streamed sub-transactions, so
//! begin/commit pairs arrive strictly in commit order and row messages always
//! belong to the transaction currently open.

use crate::errors::{BridgeError, BridgeResult};
use crate::types::{Lsn, Oid, Xid};

/// One column of a relation's schema.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    /// Part of the replica identity key.
    pub is_key: bool,
    pub name: String,
    pub type_oid: Oid,
    pub type_modifier: i32,
}

/// Schema information for a relation, as announced on the stream.
#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub relid: Oid,
    pub namespace: String,
    pub name: String,
    pub replica_identity: char,
    pub columns: Vec<ColumnSpec>,
}

impl RelationInfo {
    pub fn has_key(&self) -> bool {
        self.columns.iter().any(|c| c.is_key)
    }
}

/// One column value within a tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleValue {
    Null,
    /// An unchanged TOASTed value the stream did not resend.
    Unchanged,
    /// Text-format column data.
    Text(String),
}

pub type TupleData = Vec<TupleValue>;

/// A decoded pgoutput message.
#[derive(Debug, Clone)]
pub enum LogicalMessage {
    Begin {
        final_lsn: Lsn,
        commit_timestamp: i64,
        xid: Xid,
    },
    Commit {
        commit_lsn: Lsn,
        end_lsn: Lsn,
    },
    Relation(RelationInfo),
    Insert {
        relid: Oid,
        new: TupleData,
    },
    Update {
        relid: Oid,
        /// Old row image, tagged 'K' (key columns only) or 'O' (full row).
        old: Option<(char, TupleData)>,
        new: TupleData,
    },
    Delete {
        relid: Oid,
        key_kind: char,
        old: TupleData,
    },
    Truncate {
        relids: Vec<Oid>,
    },
    /// Origin, type and logical-decoding messages carry nothing the bridge
    /// forwards.
    Ignored,
}

pub fn parse_message(buffer: &[u8]) -> BridgeResult<LogicalMessage> {
    let mut cursor = Cursor::new(buffer);
    let tag = cursor.read_u8()?;

    match tag {
        b'B' => {
            let final_lsn = cursor.read_u64()?;
            let commit_timestamp = cursor.read_i64()?;
            let xid = cursor.read_u32()?;
            Ok(LogicalMessage::Begin {
                final_lsn,
                commit_timestamp,
                xid,
            })
        }
        b'C' => {
            let _flags = cursor.read_u8()?;
            let commit_lsn = cursor.read_u64()?;
            let end_lsn = cursor.read_u64()?;
            let _timestamp = cursor.read_i64()?;
            Ok(LogicalMessage::Commit {
                commit_lsn,
                end_lsn,
            })
        }
        b'R' => parse_relation(&mut cursor),
        b'I' => {
            let relid = cursor.read_u32()?;
            let marker = cursor.read_u8()?;
            if marker != b'N' {
                return Err(BridgeError::protocol(format!(
                    "unexpected tuple marker {} in insert message",
                    marker as char
                )));
            }
            let new = parse_tuple(&mut cursor)?;
            Ok(LogicalMessage::Insert { relid, new })
        }
        b'U' => parse_update(&mut cursor),
        b'D' => {
            let relid = cursor.read_u32()?;
            let key_kind = cursor.read_u8()? as char;
            if key_kind != 'K' && key_kind != 'O' {
                return Err(BridgeError::protocol(format!(
                    "unexpected tuple marker {key_kind} in delete message"
                )));
            }
            let old = parse_tuple(&mut cursor)?;
            Ok(LogicalMessage::Delete {
                relid,
                key_kind,
                old,
            })
        }
        b'T' => {
            let count = cursor.read_u32()?;
            let _options = cursor.read_u8()?;
            let mut relids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                relids.push(cursor.read_u32()?);
            }
            Ok(LogicalMessage::Truncate { relids })
        }
        b'O' | b'Y' | b'M' => Ok(LogicalMessage::Ignored),
        other => Err(BridgeError::protocol(format!(
            "unknown replication message type: {}",
            other as char
        ))),
    }
}

fn parse_relation(cursor: &mut Cursor) -> BridgeResult<LogicalMessage> {
    let relid = cursor.read_u32()?;
    let namespace = cursor.read_cstr()?;
    let name = cursor.read_cstr()?;
    let replica_identity = cursor.read_u8()? as char;
    let column_count = cursor.read_u16()?;

    let mut columns = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        let flags = cursor.read_u8()?;
        let name = cursor.read_cstr()?;
        let type_oid = cursor.read_u32()?;
        let type_modifier = cursor.read_i32()?;
        columns.push(ColumnSpec {
            is_key: flags & 1 != 0,
            name,
            type_oid,
            type_modifier,
        });
    }

    Ok(LogicalMessage::Relation(RelationInfo {
        relid,
        // an empty namespace denotes pg_catalog
        namespace: if namespace.is_empty() {
            "pg_catalog".to_string()
        } else {
            namespace
        },
        name,
        replica_identity,
        columns,
    }))
}

fn parse_update(cursor: &mut Cursor) -> BridgeResult<LogicalMessage> {
    let relid = cursor.read_u32()?;
    let mut marker = cursor.read_u8()? as char;

    let old = if marker == 'K' || marker == 'O' {
        let old_tuple = parse_tuple(cursor)?;
        let kind = marker;
        marker = cursor.read_u8()? as char;
        Some((kind, old_tuple))
    } else {
        None
    };

    if marker != 'N' {
        return Err(BridgeError::protocol(format!(
            "unexpected tuple marker {marker} in update message"
        )));
    }
    let new = parse_tuple(cursor)?;
    Ok(LogicalMessage::Update { relid, old, new })
}

fn parse_tuple(cursor: &mut Cursor) -> BridgeResult<TupleData> {
    let column_count = cursor.read_u16()?;
    let mut columns = Vec::with_capacity(column_count as usize);

    for _ in 0..column_count {
        let kind = cursor.read_u8()?;
        match kind {
            b'n' => columns.push(TupleValue::Null),
            b'u' => columns.push(TupleValue::Unchanged),
            b't' => {
                let len = cursor.read_u32()? as usize;
                let data = cursor.read_bytes(len)?;
                columns.push(TupleValue::Text(String::from_utf8(data.to_vec())?));
            }
            other => {
                return Err(BridgeError::protocol(format!(
                    "unknown tuple column kind: {}",
                    other as char
                )));
            }
        }
    }

    Ok(columns)
}

/// Byte-walking helper over one message buffer. All integers are big-endian
/// on the wire.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> BridgeResult<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(BridgeError::protocol("truncated replication message"));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> BridgeResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> BridgeResult<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> BridgeResult<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i32(&mut self) -> BridgeResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    fn read_u64(&mut self) -> BridgeResult<u64> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    fn read_i64(&mut self) -> BridgeResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    fn read_cstr(&mut self) -> BridgeResult<String> {
        let start = self.pos;
        while self.pos < self.buf.len() && self.buf[self.pos] != 0 {
            self.pos += 1;
        }
        if self.pos >= self.buf.len() {
            return Err(BridgeError::protocol(
                "unterminated string in replication message",
            ));
        }
        let text = String::from_utf8(self.buf[start..self.pos].to_vec())?;
        self.pos += 1; // terminator
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_cstr(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
    }

    fn push_text_column(buf: &mut Vec<u8>, value: &str) {
        buf.push(b't');
        buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        buf.extend_from_slice(value.as_bytes());
    }

    fn relation_message() -> Vec<u8> {
        let mut buf = vec![b'R'];
        buf.extend_from_slice(&16385u32.to_be_bytes());
        push_cstr(&mut buf, "public");
        push_cstr(&mut buf, "users");
        buf.push(b'd');
        buf.extend_from_slice(&2u16.to_be_bytes());
        // id: key column
        buf.push(1);
        push_cstr(&mut buf, "id");
        buf.extend_from_slice(&23u32.to_be_bytes());
        buf.extend_from_slice(&(-1i32).to_be_bytes());
        // name: plain column
        buf.push(0);
        push_cstr(&mut buf, "name");
        buf.extend_from_slice(&25u32.to_be_bytes());
        buf.extend_from_slice(&(-1i32).to_be_bytes());
        buf
    }

    #[test]
    fn test_parse_begin() {
        let mut buf = vec![b'B'];
        buf.extend_from_slice(&0x110u64.to_be_bytes());
        buf.extend_from_slice(&99i64.to_be_bytes());
        buf.extend_from_slice(&7u32.to_be_bytes());

        match parse_message(&buf).unwrap() {
            LogicalMessage::Begin {
                final_lsn,
                commit_timestamp,
                xid,
            } => {
                assert_eq!(final_lsn, 0x110);
                assert_eq!(commit_timestamp, 99);
                assert_eq!(xid, 7);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_commit() {
        let mut buf = vec![b'C', 0];
        buf.extend_from_slice(&0x110u64.to_be_bytes());
        buf.extend_from_slice(&0x118u64.to_be_bytes());
        buf.extend_from_slice(&99i64.to_be_bytes());

        match parse_message(&buf).unwrap() {
            LogicalMessage::Commit {
                commit_lsn,
                end_lsn,
            } => {
                assert_eq!(commit_lsn, 0x110);
                assert_eq!(end_lsn, 0x118);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_relation() {
        match parse_message(&relation_message()).unwrap() {
            LogicalMessage::Relation(rel) => {
                assert_eq!(rel.relid, 16385);
                assert_eq!(rel.namespace, "public");
                assert_eq!(rel.name, "users");
                assert_eq!(rel.replica_identity, 'd');
                assert_eq!(rel.columns.len(), 2);
                assert!(rel.columns[0].is_key);
                assert_eq!(rel.columns[0].name, "id");
                assert_eq!(rel.columns[0].type_oid, 23);
                assert!(!rel.columns[1].is_key);
                assert!(rel.has_key());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_insert() {
        let mut buf = vec![b'I'];
        buf.extend_from_slice(&16385u32.to_be_bytes());
        buf.push(b'N');
        buf.extend_from_slice(&2u16.to_be_bytes());
        push_text_column(&mut buf, "42");
        buf.push(b'n');

        match parse_message(&buf).unwrap() {
            LogicalMessage::Insert { relid, new } => {
                assert_eq!(relid, 16385);
                assert_eq!(new[0], TupleValue::Text("42".to_string()));
                assert_eq!(new[1], TupleValue::Null);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_with_old_key() {
        let mut buf = vec![b'U'];
        buf.extend_from_slice(&16385u32.to_be_bytes());
        buf.push(b'K');
        buf.extend_from_slice(&1u16.to_be_bytes());
        push_text_column(&mut buf, "41");
        buf.push(b'N');
        buf.extend_from_slice(&1u16.to_be_bytes());
        push_text_column(&mut buf, "42");

        match parse_message(&buf).unwrap() {
            LogicalMessage::Update { relid, old, new } => {
                assert_eq!(relid, 16385);
                let (kind, old_tuple) = old.unwrap();
                assert_eq!(kind, 'K');
                assert_eq!(old_tuple[0], TupleValue::Text("41".to_string()));
                assert_eq!(new[0], TupleValue::Text("42".to_string()));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_delete() {
        let mut buf = vec![b'D'];
        buf.extend_from_slice(&16385u32.to_be_bytes());
        buf.push(b'K');
        buf.extend_from_slice(&1u16.to_be_bytes());
        push_text_column(&mut buf, "42");

        match parse_message(&buf).unwrap() {
            LogicalMessage::Delete {
                relid,
                key_kind,
                old,
            } => {
                assert_eq!(relid, 16385);
                assert_eq!(key_kind, 'K');
                assert_eq!(old[0], TupleValue::Text("42".to_string()));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_truncate() {
        let mut buf = vec![b'T'];
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.push(0);
        buf.extend_from_slice(&16385u32.to_be_bytes());
        buf.extend_from_slice(&16390u32.to_be_bytes());

        match parse_message(&buf).unwrap() {
            LogicalMessage::Truncate { relids } => assert_eq!(relids, vec![16385, 16390]),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_truncated_message_is_an_error() {
        let buf = vec![b'B', 0x00, 0x01];
        assert!(parse_message(&buf).is_err());
        assert!(parse_message(&[]).is_err());
    }

    #[test]
    fn test_unknown_tag_is_an_error() {
        assert!(parse_message(&[b'Z']).is_err());
    }
}
