//! Message encoder
//!
//! Formats key/value payloads into broker-ready bytes. The binary format
//! prepends the Confluent wire framing (one zero magic byte followed by the
//! big-endian 32-bit registry schema id) to each payload independently; the
//! json format writes the self-describing textual payload unchanged. A nil
//! value (a deletion) passes through as nil rather than as a framed empty
//! payload, so log compaction sees a tombstone.

use crate::config::OutputFormat;
use crate::errors::{BridgeError, BridgeResult};
use crate::mapper::TableMetadata;

/// Leading magic byte of the binary wire format.
pub const WIRE_FORMAT_MAGIC: u8 = 0x00;

/// Length of the framing header: magic byte plus big-endian schema id.
pub const WIRE_FORMAT_HEADER_LEN: usize = 5;

/// Frames a payload with the registry wire header.
pub fn encode_framed(schema_id: i32, payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(WIRE_FORMAT_HEADER_LEN + payload.len());
    framed.push(WIRE_FORMAT_MAGIC);
    framed.extend_from_slice(&schema_id.to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Splits a framed record back into its schema id and payload.
pub fn decode_framed(buf: &[u8]) -> BridgeResult<(i32, &[u8])> {
    if buf.len() < WIRE_FORMAT_HEADER_LEN || buf[0] != WIRE_FORMAT_MAGIC {
        return Err(BridgeError::protocol("malformed wire-format header"));
    }
    let mut id_bytes = [0u8; 4];
    id_bytes.copy_from_slice(&buf[1..5]);
    Ok((i32::from_be_bytes(id_bytes), &buf[WIRE_FORMAT_HEADER_LEN..]))
}

/// Encodes a key/value pair for the given table under the configured format.
///
/// Returns owned buffers; ownership passes to the enqueue path. An absent
/// value stays absent in both formats.
pub fn encode_message(
    format: OutputFormat,
    table: &TableMetadata,
    key: Option<&[u8]>,
    value: Option<&[u8]>,
) -> BridgeResult<(Option<Vec<u8>>, Option<Vec<u8>>)> {
    match format {
        OutputFormat::Json => Ok((key.map(<[u8]>::to_vec), value.map(<[u8]>::to_vec))),
        OutputFormat::Binary => {
            let encoded_key = match key {
                Some(key) => {
                    let id = table.key_schema_id.ok_or_else(|| {
                        BridgeError::encoding(&table.topic, "no registered key schema id")
                    })?;
                    Some(encode_framed(id, key))
                }
                None => None,
            };
            let encoded_value = match value {
                Some(value) => {
                    let id = table.value_schema_id.ok_or_else(|| {
                        BridgeError::encoding(&table.topic, "no registered value schema id")
                    })?;
                    Some(encode_framed(id, value))
                }
                None => None,
            };
            Ok((encoded_key, encoded_value))
        }
    }
}
