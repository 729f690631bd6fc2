//! Frame encoding and decoding.
//!
//! Every frame starts with a one-byte class discriminator. SYNC frames carry
//! a one-byte sub-type and a length-prefixed payload; AWARENESS frames carry
//! a list of presence entries; PING and PONG are bare class bytes.

use crate::crdt::StateVector;
use crate::error::{Result, SyncError};
use crate::wire::{self, Cursor};

use super::awareness::AwarenessEntry;

/// Frame class discriminators.
pub mod frame_class {
    pub const SYNC: u8 = 0x00;
    pub const AWARENESS: u8 = 0x01;
    pub const PING: u8 = 0x11;
    pub const PONG: u8 = 0x12;
}

/// SYNC frame sub-types.
pub mod sync_type {
    /// State-vector request.
    pub const STEP1: u8 = 0;
    /// Diff reply against a requested state vector.
    pub const STEP2: u8 = 1;
    /// Incremental document update.
    pub const UPDATE: u8 = 2;
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Sync(SyncFrame),
    Awareness(Vec<AwarenessEntry>),
    Ping,
    Pong,
}

impl Frame {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let frame = match cursor.read_u8()? {
            frame_class::SYNC => Frame::Sync(SyncFrame::decode_from(&mut cursor)?),
            frame_class::AWARENESS => {
                let count = cursor.read_var_u64()?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    entries.push(AwarenessEntry::decode_from(&mut cursor)?);
                }
                Frame::Awareness(entries)
            }
            frame_class::PING => Frame::Ping,
            frame_class::PONG => Frame::Pong,
            other => {
                return Err(SyncError::DecodeError(format!(
                    "unknown frame class 0x{:02x}",
                    other
                )))
            }
        };
        cursor.finish()?;
        Ok(frame)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Frame::Sync(sync) => {
                out.push(frame_class::SYNC);
                sync.encode_to(&mut out);
            }
            Frame::Awareness(entries) => {
                out.push(frame_class::AWARENESS);
                wire::write_var_u64(&mut out, entries.len() as u64);
                for entry in entries {
                    entry.encode_to(&mut out);
                }
            }
            Frame::Ping => out.push(frame_class::PING),
            Frame::Pong => out.push(frame_class::PONG),
        }
        out
    }

    /// Create a SYNC_STEP1 frame from a state vector.
    pub fn step1(sv: &StateVector) -> Self {
        Frame::Sync(SyncFrame::Step1(sv.encode()))
    }

    /// Create a SYNC_STEP2 frame from an encoded update.
    pub fn step2(update: Vec<u8>) -> Self {
        Frame::Sync(SyncFrame::Step2(update))
    }

    /// Create an UPDATE frame from an encoded update.
    pub fn update(update: Vec<u8>) -> Self {
        Frame::Sync(SyncFrame::Update(update))
    }

    /// Create an AWARENESS frame from presence entries.
    pub fn awareness(entries: Vec<AwarenessEntry>) -> Self {
        Frame::Awareness(entries)
    }
}

/// A SYNC frame body.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncFrame {
    /// State-vector request containing the sender's state vector. The
    /// receiver replies with STEP2 carrying whatever the sender is missing.
    Step1(Vec<u8>),
    /// Reply to STEP1 carrying an encoded update.
    Step2(Vec<u8>),
    /// Incremental update sent after initial sync.
    Update(Vec<u8>),
}

impl SyncFrame {
    pub(crate) fn decode_from(cursor: &mut Cursor<'_>) -> Result<Self> {
        let sub = cursor.read_u8()?;
        let payload = cursor.read_buf()?.to_vec();
        match sub {
            sync_type::STEP1 => Ok(SyncFrame::Step1(payload)),
            sync_type::STEP2 => Ok(SyncFrame::Step2(payload)),
            sync_type::UPDATE => Ok(SyncFrame::Update(payload)),
            other => Err(SyncError::DecodeError(format!(
                "unknown sync sub-type {}",
                other
            ))),
        }
    }

    pub(crate) fn encode_to(&self, out: &mut Vec<u8>) {
        let (sub, payload) = match self {
            SyncFrame::Step1(p) => (sync_type::STEP1, p),
            SyncFrame::Step2(p) => (sync_type::STEP2, p),
            SyncFrame::Update(p) => (sync_type::UPDATE, p),
        };
        out.push(sub);
        wire::write_buf(out, payload);
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            SyncFrame::Step1(p) | SyncFrame::Step2(p) | SyncFrame::Update(p) => p,
        }
    }
}
