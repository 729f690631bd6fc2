//! Update codec: two supported sub-encodings of the same operation model.
//!
//! `Compact` groups operations by peer and leaves clocks implicit (each
//! peer's operations in a diff form one contiguous clock range). `Legacy` is
//! a flat, self-describing operation list. Neither carries a format tag, so
//! decoding tries an ordered strategy list — Compact first, then Legacy —
//! and reports an error only when every attempt fails. A successful decode
//! must consume the buffer exactly; trailing bytes disqualify the attempt.

use std::collections::BTreeMap;

use tracing::debug;

use crate::doc::{InlineAttr, RunToken};
use crate::error::{Result, SyncError};
use crate::wire::{self, Cursor};

use super::{BlockPart, Op, OpBody, OpId, Parent, Update, Value, ROOT_ORDER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateFormat {
    /// Per-peer column grouping with implicit sequential clocks.
    #[default]
    Compact,
    /// Flat operation list, every op carrying its full id.
    Legacy,
}

impl UpdateFormat {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateFormat::Compact => "compact",
            UpdateFormat::Legacy => "legacy",
        }
    }
}

/// Decode attempt order. The compact form is the common case; the legacy
/// form is kept for peers that never moved off it.
pub const DECODE_ORDER: [UpdateFormat; 2] = [UpdateFormat::Compact, UpdateFormat::Legacy];

// Parent kind tags.
const PARENT_ROOT: u8 = 0;
const PARENT_BLOCK: u8 = 1;

// Block part tags.
const PART_FIELDS: u8 = 0;
const PART_RUN: u8 = 1;
const PART_CHILDREN: u8 = 2;

// Op body tags.
const BODY_SET_FIELD: u8 = 0;
const BODY_INSERT_BLOCK: u8 = 1;
const BODY_INSERT_TOKEN: u8 = 2;
const BODY_CLEAR_LIST: u8 = 3;

// Value tags.
const VALUE_STR: u8 = 0;
const VALUE_UINT: u8 = 1;

// Run token tags.
const TOKEN_CHAR: u8 = 0;
const TOKEN_FORMAT: u8 = 1;

/// Version byte of the snapshot envelope.
pub const SNAPSHOT_VERSION: u8 = 1;

pub fn encode_update(update: &Update, format: UpdateFormat) -> Vec<u8> {
    let mut out = Vec::new();
    match format {
        UpdateFormat::Compact => encode_compact(update, &mut out),
        UpdateFormat::Legacy => encode_legacy(update, &mut out),
    }
    out
}

/// Decode with the fallback cascade. Failures of individual strategies are
/// local and silent; only total exhaustion surfaces an error, listing every
/// attempt's failure.
pub fn decode_update(bytes: &[u8]) -> Result<Update> {
    let mut attempts = Vec::new();
    for format in DECODE_ORDER {
        match decode_with(bytes, format) {
            Ok(update) => {
                if !attempts.is_empty() {
                    debug!(format = format.name(), "update decoded via fallback");
                }
                return Ok(update);
            }
            Err(e) => attempts.push(format!("{}: {}", format.name(), e)),
        }
    }
    Err(SyncError::DecodeError(format!(
        "no update sub-encoding matched [{}]",
        attempts.join("; ")
    )))
}

/// Decode assuming one specific sub-encoding.
pub fn decode_with(bytes: &[u8], format: UpdateFormat) -> Result<Update> {
    let mut cursor = Cursor::new(bytes);
    let update = match format {
        UpdateFormat::Compact => decode_compact(&mut cursor)?,
        UpdateFormat::Legacy => decode_legacy(&mut cursor)?,
    };
    cursor.finish()?;
    Ok(update)
}

/// Wrap an encoded update in the snapshot envelope:
/// `[version byte][varint length][payload]`.
pub fn encode_snapshot(update: &Update, format: UpdateFormat) -> Vec<u8> {
    let payload = encode_update(update, format);
    let mut out = Vec::with_capacity(payload.len() + 6);
    out.push(SNAPSHOT_VERSION);
    wire::write_buf(&mut out, &payload);
    out
}

/// Unwrap a snapshot envelope and decode its payload. The length prefix is
/// honored: bytes past the declared payload are ignored, not decoded.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Update> {
    let mut cursor = Cursor::new(bytes);
    let version = cursor.read_u8()?;
    if version != SNAPSHOT_VERSION {
        return Err(SyncError::DecodeError(format!(
            "unsupported snapshot format version {}",
            version
        )));
    }
    let payload = cursor.read_buf()?;
    decode_update(payload)
}

fn encode_legacy(update: &Update, out: &mut Vec<u8>) {
    wire::write_var_u64(out, update.ops.len() as u64);
    for op in &update.ops {
        wire::write_var_u64(out, op.id.peer);
        wire::write_var_u64(out, op.id.clock);
        encode_parent(&op.parent, out);
        encode_body(&op.body, out);
    }
}

fn decode_legacy(cursor: &mut Cursor<'_>) -> Result<Update> {
    let count = cursor.read_var_u64()?;
    let mut ops = Vec::new();
    for _ in 0..count {
        let peer = cursor.read_var_u64()?;
        let clock = cursor.read_var_u64()?;
        let parent = decode_parent(cursor)?;
        let body = decode_body(cursor)?;
        ops.push(Op {
            id: OpId::new(peer, clock),
            parent,
            body,
        });
    }
    Ok(Update { ops })
}

fn encode_compact(update: &Update, out: &mut Vec<u8>) {
    let mut by_peer: BTreeMap<u64, Vec<&Op>> = BTreeMap::new();
    for op in &update.ops {
        by_peer.entry(op.id.peer).or_default().push(op);
    }
    wire::write_var_u64(out, by_peer.len() as u64);
    for (peer, mut ops) in by_peer {
        ops.sort_by_key(|op| op.id.clock);
        // A diff is always a contiguous clock suffix per peer; the compact
        // form relies on that to leave clocks implicit.
        debug_assert!(ops
            .windows(2)
            .all(|pair| pair[1].id.clock == pair[0].id.clock + 1));
        wire::write_var_u64(out, peer);
        wire::write_var_u64(out, ops.len() as u64);
        wire::write_var_u64(out, ops.first().map(|op| op.id.clock).unwrap_or(0));
        for op in ops {
            encode_parent(&op.parent, out);
            encode_body(&op.body, out);
        }
    }
}

fn decode_compact(cursor: &mut Cursor<'_>) -> Result<Update> {
    let peer_count = cursor.read_var_u64()?;
    let mut ops = Vec::new();
    for _ in 0..peer_count {
        let peer = cursor.read_var_u64()?;
        let count = cursor.read_var_u64()?;
        let first_clock = cursor.read_var_u64()?;
        for i in 0..count {
            let parent = decode_parent(cursor)?;
            let body = decode_body(cursor)?;
            ops.push(Op {
                id: OpId::new(peer, first_clock + i),
                parent,
                body,
            });
        }
    }
    Ok(Update { ops })
}

fn encode_parent(parent: &Parent, out: &mut Vec<u8>) {
    match parent {
        Parent::Root => {
            out.push(PARENT_ROOT);
            wire::write_string(out, ROOT_ORDER);
        }
        Parent::Block { block, part } => {
            out.push(PARENT_BLOCK);
            wire::write_string(out, block);
            out.push(match part {
                BlockPart::Fields => PART_FIELDS,
                BlockPart::Run => PART_RUN,
                BlockPart::Children => PART_CHILDREN,
            });
        }
    }
}

fn decode_parent(cursor: &mut Cursor<'_>) -> Result<Parent> {
    match cursor.read_u8()? {
        PARENT_ROOT => {
            let name = cursor.read_string()?;
            if name != ROOT_ORDER {
                return Err(SyncError::DecodeError(format!(
                    "unknown root sequence {:?}",
                    name
                )));
            }
            Ok(Parent::Root)
        }
        PARENT_BLOCK => {
            let block = cursor.read_string()?;
            let part = match cursor.read_u8()? {
                PART_FIELDS => BlockPart::Fields,
                PART_RUN => BlockPart::Run,
                PART_CHILDREN => BlockPart::Children,
                other => {
                    return Err(SyncError::DecodeError(format!(
                        "unknown block part tag {}",
                        other
                    )))
                }
            };
            Ok(Parent::Block { block, part })
        }
        other => Err(SyncError::DecodeError(format!(
            "unknown parent tag {}",
            other
        ))),
    }
}

fn encode_body(body: &OpBody, out: &mut Vec<u8>) {
    match body {
        OpBody::SetField { key, value } => {
            out.push(BODY_SET_FIELD);
            wire::write_string(out, key);
            encode_value(value, out);
        }
        OpBody::InsertBlock { origin, block } => {
            out.push(BODY_INSERT_BLOCK);
            encode_origin(origin, out);
            wire::write_string(out, block);
        }
        OpBody::InsertToken { origin, token } => {
            out.push(BODY_INSERT_TOKEN);
            encode_origin(origin, out);
            encode_token(token, out);
        }
        OpBody::ClearList => out.push(BODY_CLEAR_LIST),
    }
}

fn decode_body(cursor: &mut Cursor<'_>) -> Result<OpBody> {
    match cursor.read_u8()? {
        BODY_SET_FIELD => {
            let key = cursor.read_string()?;
            let value = decode_value(cursor)?;
            Ok(OpBody::SetField { key, value })
        }
        BODY_INSERT_BLOCK => {
            let origin = decode_origin(cursor)?;
            let block = cursor.read_string()?;
            Ok(OpBody::InsertBlock { origin, block })
        }
        BODY_INSERT_TOKEN => {
            let origin = decode_origin(cursor)?;
            let token = decode_token(cursor)?;
            Ok(OpBody::InsertToken { origin, token })
        }
        BODY_CLEAR_LIST => Ok(OpBody::ClearList),
        other => Err(SyncError::DecodeError(format!(
            "unknown op body tag {}",
            other
        ))),
    }
}

fn encode_origin(origin: &Option<OpId>, out: &mut Vec<u8>) {
    match origin {
        Some(id) => {
            out.push(1);
            wire::write_var_u64(out, id.peer);
            wire::write_var_u64(out, id.clock);
        }
        None => out.push(0),
    }
}

fn decode_origin(cursor: &mut Cursor<'_>) -> Result<Option<OpId>> {
    match cursor.read_u8()? {
        0 => Ok(None),
        1 => {
            let peer = cursor.read_var_u64()?;
            let clock = cursor.read_var_u64()?;
            Ok(Some(OpId::new(peer, clock)))
        }
        other => Err(SyncError::DecodeError(format!(
            "unknown origin flag {}",
            other
        ))),
    }
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Str(s) => {
            out.push(VALUE_STR);
            wire::write_string(out, s);
        }
        Value::UInt(v) => {
            out.push(VALUE_UINT);
            wire::write_var_u64(out, *v);
        }
    }
}

fn decode_value(cursor: &mut Cursor<'_>) -> Result<Value> {
    match cursor.read_u8()? {
        VALUE_STR => Ok(Value::Str(cursor.read_string()?)),
        VALUE_UINT => Ok(Value::UInt(cursor.read_var_u64()?)),
        other => Err(SyncError::DecodeError(format!(
            "unknown value tag {}",
            other
        ))),
    }
}

fn encode_token(token: &RunToken, out: &mut Vec<u8>) {
    match token {
        RunToken::Char(c) => {
            out.push(TOKEN_CHAR);
            wire::write_var_u64(out, *c as u64);
        }
        RunToken::Format { attr, on } => {
            out.push(TOKEN_FORMAT);
            wire::write_string(out, attr.as_str());
            out.push(u8::from(*on));
        }
    }
}

fn decode_token(cursor: &mut Cursor<'_>) -> Result<RunToken> {
    match cursor.read_u8()? {
        TOKEN_CHAR => {
            let code = cursor.read_var_u64()?;
            let c = u32::try_from(code)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| {
                    SyncError::DecodeError(format!("invalid character code point {}", code))
                })?;
            Ok(RunToken::Char(c))
        }
        TOKEN_FORMAT => {
            let attr = InlineAttr::from_raw(&cursor.read_string()?);
            let on = match cursor.read_u8()? {
                0 => false,
                1 => true,
                other => {
                    return Err(SyncError::DecodeError(format!(
                        "unknown format toggle flag {}",
                        other
                    )))
                }
            };
            Ok(RunToken::Format { attr, on })
        }
        other => Err(SyncError::DecodeError(format!(
            "unknown run token tag {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{Replica, StateVector};
    use crate::doc::{BlockAttrs, BlockTag};

    fn hello_update() -> Update {
        let mut replica = Replica::new(1);
        replica.transact(|tx| {
            let p = tx.append_block(BlockTag::Paragraph, BlockAttrs::default());
            tx.append_text(&p, "Hello").unwrap();
        });
        replica.diff(&StateVector::new())
    }

    #[test]
    fn test_roundtrip_both_formats() {
        let update = hello_update();
        for format in DECODE_ORDER {
            let bytes = encode_update(&update, format);
            assert!(!bytes.is_empty());
            let decoded = decode_with(&bytes, format).unwrap();
            assert_eq!(decoded, update);
        }
    }

    #[test]
    fn test_fallback_decodes_either_format_identically() {
        let update = hello_update();
        let compact = decode_update(&encode_update(&update, UpdateFormat::Compact)).unwrap();
        let legacy = decode_update(&encode_update(&update, UpdateFormat::Legacy)).unwrap();
        assert_eq!(compact, legacy);
    }

    #[test]
    fn test_legacy_only_payload_decodes_after_compact_fails() {
        let update = hello_update();
        let bytes = encode_update(&update, UpdateFormat::Legacy);
        // Not a valid compact payload...
        assert!(decode_with(&bytes, UpdateFormat::Compact).is_err());
        // ...yet the cascade still lands on it.
        assert_eq!(decode_update(&bytes).unwrap(), update);
    }

    #[test]
    fn test_exhausted_cascade_reports_every_attempt() {
        let garbage = [0xde, 0xad, 0xbe, 0xef, 0xff];
        let err = decode_update(&garbage).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("compact"), "missing compact attempt: {}", msg);
        assert!(msg.contains("legacy"), "missing legacy attempt: {}", msg);
    }

    #[test]
    fn test_trailing_bytes_disqualify_a_decode() {
        let update = hello_update();
        let mut bytes = encode_update(&update, UpdateFormat::Legacy);
        bytes.push(0x00);
        assert!(decode_with(&bytes, UpdateFormat::Legacy).is_err());
    }

    #[test]
    fn test_scenario_a_hello_document() {
        let update = hello_update();
        assert!(!update.is_empty());

        let bytes = encode_update(&update, UpdateFormat::Compact);
        let mut target = Replica::new(2);
        target.apply(&decode_update(&bytes).unwrap());

        assert_eq!(target.doc().len(), 1);
        let block = target.doc().block(&target.doc().order()[0]).unwrap();
        assert_eq!(block.tag, BlockTag::Paragraph);
        assert_eq!(block.run().unwrap().plain_text(), "Hello");
    }

    #[test]
    fn test_snapshot_envelope_roundtrip() {
        let update = hello_update();
        let bytes = encode_snapshot(&update, UpdateFormat::Compact);
        assert_eq!(bytes[0], SNAPSHOT_VERSION);
        assert_eq!(decode_snapshot(&bytes).unwrap(), update);
    }

    #[test]
    fn test_snapshot_honors_length_prefix() {
        let update = hello_update();
        let mut bytes = encode_snapshot(&update, UpdateFormat::Legacy);
        // End of buffer is not end of payload.
        bytes.extend_from_slice(&[0xaa, 0xbb, 0xcc]);
        assert_eq!(decode_snapshot(&bytes).unwrap(), update);
    }

    #[test]
    fn test_snapshot_rejects_unknown_version() {
        let update = hello_update();
        let mut bytes = encode_snapshot(&update, UpdateFormat::Compact);
        bytes[0] = 9;
        assert!(decode_snapshot(&bytes).is_err());
    }

    #[test]
    fn test_empty_update_roundtrip() {
        let update = Update::default();
        for format in DECODE_ORDER {
            let bytes = encode_update(&update, format);
            assert_eq!(decode_update(&bytes).unwrap(), update);
        }
    }
}
