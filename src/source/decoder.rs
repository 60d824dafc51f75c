//! Logical change decoder
//!
//! Adapts parsed pgoutput messages to the [`ChangeHandler`] callbacks. Keeps
//! the per-relation schema cache and the xid of the transaction currently
//! open (pgoutput commit messages don't repeat it), and materialises row
//! images into the JSON payloads the pipeline forwards.

use crate::errors::{BridgeError, BridgeResult};
use crate::source::ChangeHandler;
use crate::source::parser::{self, LogicalMessage, RelationInfo};
use crate::source::schema;
use crate::types::{Lsn, Oid, Xid};
use std::collections::HashMap;
use tracing::debug;

#[derive(Default)]
pub struct Decoder {
    relations: HashMap<Oid, RelationInfo>,
    current_xid: Option<Xid>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one XLogData payload and drives the handler. Parse failures
    /// are reported through `on_source_error`, which applies the error
    /// policy; everything else propagates the handler's status unchanged.
    pub fn dispatch(
        &mut self,
        wal_pos: Lsn,
        payload: &[u8],
        handler: &mut dyn ChangeHandler,
    ) -> BridgeResult<()> {
        let message = match parser::parse_message(payload) {
            Ok(message) => message,
            Err(e) => {
                return handler.on_source_error(&format!("failed to parse change: {e}"));
            }
        };

        match message {
            LogicalMessage::Begin { xid, .. } => {
                self.current_xid = Some(xid);
                handler.on_begin(xid, wal_pos)
            }
            LogicalMessage::Commit { commit_lsn, .. } => {
                let xid = self.current_xid.take().ok_or_else(|| {
                    BridgeError::protocol("commit event without a preceding begin")
                })?;
                handler.on_commit(xid, commit_lsn)
            }
            LogicalMessage::Relation(rel) => {
                let (key_schema, value_schema) = schema::generate_schemas(&rel);
                let relid = rel.relid;
                self.relations.insert(relid, rel);
                handler.on_table_schema(relid, key_schema.as_deref(), &value_schema, wal_pos)
            }
            LogicalMessage::Insert { relid, new } => {
                let rel = self.relation(relid)?;
                let value = schema::row_to_json(rel, &new)?;
                let key = schema::key_to_json(rel, &new)?;
                handler.on_insert(relid, key.as_deref(), &value, wal_pos)
            }
            LogicalMessage::Update { relid, old, new } => {
                let rel = self.relation(relid)?;
                let value = schema::row_to_json(rel, &new)?;
                // The old image identifies the row when the key changed or
                // the replica identity is full; otherwise the new row's key
                // columns do.
                let (key, old_row) = match &old {
                    Some((kind, old_tuple)) => {
                        let key = schema::key_to_json(rel, old_tuple)?;
                        let old_row = if *kind == 'O' {
                            Some(schema::row_to_json(rel, old_tuple)?)
                        } else {
                            None
                        };
                        (key, old_row)
                    }
                    None => (schema::key_to_json(rel, &new)?, None),
                };
                handler.on_update(relid, key.as_deref(), old_row.as_deref(), &value, wal_pos)
            }
            LogicalMessage::Delete {
                relid,
                key_kind,
                old,
            } => {
                let rel = self.relation(relid)?;
                let key = schema::key_to_json(rel, &old)?;
                let old_row = if key_kind == 'O' {
                    Some(schema::row_to_json(rel, &old)?)
                } else {
                    None
                };
                handler.on_delete(relid, key.as_deref(), old_row.as_deref(), wal_pos)
            }
            LogicalMessage::Truncate { relids } => {
                // Truncations are not forwarded; downstream compaction has no
                // per-key event to anchor them to.
                debug!("ignoring truncate of {} relation(s)", relids.len());
                Ok(())
            }
            LogicalMessage::Ignored => Ok(()),
        }
    }

    fn relation(&self, relid: Oid) -> BridgeResult<&RelationInfo> {
        self.relations
            .get(&relid)
            .ok_or(BridgeError::UnknownRelation { relid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SyncStatus;

    /// Records every callback as a readable line.
    #[derive(Default)]
    struct RecordingHandler {
        events: Vec<String>,
    }

    impl ChangeHandler for RecordingHandler {
        fn on_begin(&mut self, xid: Xid, wal_pos: Lsn) -> BridgeResult<()> {
            self.events.push(format!("begin {xid} @{wal_pos:#x}"));
            Ok(())
        }

        fn on_commit(&mut self, xid: Xid, wal_pos: Lsn) -> BridgeResult<()> {
            self.events.push(format!("commit {xid} @{wal_pos:#x}"));
            Ok(())
        }

        fn on_table_schema(
            &mut self,
            relid: Oid,
            key_schema: Option<&str>,
            _value_schema: &str,
            _wal_pos: Lsn,
        ) -> BridgeResult<()> {
            self.events
                .push(format!("schema {relid} keyed={}", key_schema.is_some()));
            Ok(())
        }

        fn on_insert(
            &mut self,
            relid: Oid,
            key: Option<&[u8]>,
            value: &[u8],
            _wal_pos: Lsn,
        ) -> BridgeResult<()> {
            self.events.push(format!(
                "insert {relid} key={:?} value={}",
                key.map(|k| String::from_utf8_lossy(k).into_owned()),
                String::from_utf8_lossy(value)
            ));
            Ok(())
        }

        fn on_update(
            &mut self,
            relid: Oid,
            key: Option<&[u8]>,
            old: Option<&[u8]>,
            _new: &[u8],
            _wal_pos: Lsn,
        ) -> BridgeResult<()> {
            self.events.push(format!(
                "update {relid} key={:?} old={}",
                key.map(|k| String::from_utf8_lossy(k).into_owned()),
                old.is_some()
            ));
            Ok(())
        }

        fn on_delete(
            &mut self,
            relid: Oid,
            key: Option<&[u8]>,
            _old: Option<&[u8]>,
            _wal_pos: Lsn,
        ) -> BridgeResult<()> {
            self.events.push(format!(
                "delete {relid} key={:?}",
                key.map(|k| String::from_utf8_lossy(k).into_owned())
            ));
            Ok(())
        }

        fn on_keepalive(&mut self, _wal_pos: Lsn) -> BridgeResult<SyncStatus> {
            Ok(SyncStatus::Clear)
        }

        fn on_source_error(&mut self, message: &str) -> BridgeResult<()> {
            self.events.push(format!("error {message}"));
            Ok(())
        }

        fn acknowledged_lsn(&self) -> Lsn {
            0
        }
    }

    fn push_cstr(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
    }

    fn relation_message(relid: Oid) -> Vec<u8> {
        let mut buf = vec![b'R'];
        buf.extend_from_slice(&relid.to_be_bytes());
        push_cstr(&mut buf, "public");
        push_cstr(&mut buf, "users");
        buf.push(b'd');
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.push(1);
        push_cstr(&mut buf, "id");
        buf.extend_from_slice(&23u32.to_be_bytes());
        buf.extend_from_slice(&(-1i32).to_be_bytes());
        buf
    }

    fn insert_message(relid: Oid, id: &str) -> Vec<u8> {
        let mut buf = vec![b'I'];
        buf.extend_from_slice(&relid.to_be_bytes());
        buf.push(b'N');
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.push(b't');
        buf.extend_from_slice(&(id.len() as u32).to_be_bytes());
        buf.extend_from_slice(id.as_bytes());
        buf
    }

    fn begin_message(xid: Xid) -> Vec<u8> {
        let mut buf = vec![b'B'];
        buf.extend_from_slice(&0x110u64.to_be_bytes());
        buf.extend_from_slice(&0i64.to_be_bytes());
        buf.extend_from_slice(&xid.to_be_bytes());
        buf
    }

    fn commit_message(commit_lsn: Lsn) -> Vec<u8> {
        let mut buf = vec![b'C', 0];
        buf.extend_from_slice(&commit_lsn.to_be_bytes());
        buf.extend_from_slice(&(commit_lsn + 8).to_be_bytes());
        buf.extend_from_slice(&0i64.to_be_bytes());
        buf
    }

    #[test]
    fn test_dispatch_transaction() {
        let mut decoder = Decoder::new();
        let mut handler = RecordingHandler::default();

        decoder
            .dispatch(0x100, &begin_message(7), &mut handler)
            .unwrap();
        decoder
            .dispatch(0x100, &relation_message(16385), &mut handler)
            .unwrap();
        decoder
            .dispatch(0x108, &insert_message(16385, "42"), &mut handler)
            .unwrap();
        decoder
            .dispatch(0x110, &commit_message(0x110), &mut handler)
            .unwrap();

        assert_eq!(
            handler.events,
            vec![
                "begin 7 @0x100",
                "schema 16385 keyed=true",
                "insert 16385 key=Some(\"{\\\"id\\\":42}\") value={\"id\":42}",
                "commit 7 @0x110",
            ]
        );
    }

    #[test]
    fn test_commit_without_begin_is_fatal() {
        let mut decoder = Decoder::new();
        let mut handler = RecordingHandler::default();
        assert!(
            decoder
                .dispatch(0x110, &commit_message(0x110), &mut handler)
                .is_err()
        );
    }

    #[test]
    fn test_row_for_unknown_relation_is_fatal() {
        let mut decoder = Decoder::new();
        let mut handler = RecordingHandler::default();
        let result = decoder.dispatch(0x108, &insert_message(999, "1"), &mut handler);
        assert!(matches!(
            result,
            Err(BridgeError::UnknownRelation { relid: 999 })
        ));
    }

    #[test]
    fn test_parse_failure_goes_through_source_error() {
        let mut decoder = Decoder::new();
        let mut handler = RecordingHandler::default();
        decoder.dispatch(0x100, &[b'Z'], &mut handler).unwrap();
        assert!(handler.events[0].starts_with("error "));
    }
}
