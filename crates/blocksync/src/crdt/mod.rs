//! CRDT state: logical clocks, state vectors, and the operation model.
//!
//! Every mutation of a replica is recorded as an [`Op`] carrying its own
//! [`OpId`] and enough parent linkage (a named root, or a typed content
//! parent plus sub-key) that a decoder reconstructs identical topology from
//! operations alone, independent of arrival order.

use std::collections::BTreeMap;

use crate::doc::{BlockId, RunToken};
use crate::error::Result;
use crate::wire::{self, Cursor};

pub mod codec;
mod replica;

pub use replica::{import_document, Replica, Transaction, Update};

pub type PeerId = u64;

/// Logical-clock identity of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId {
    pub peer: PeerId,
    pub clock: u64,
}

impl OpId {
    pub fn new(peer: PeerId, clock: u64) -> Self {
        Self { peer, clock }
    }
}

/// Per-peer summary of already-incorporated operations. For each peer the
/// vector holds the next expected clock; a diff is "operations not yet
/// reflected in a given state vector".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateVector {
    clocks: BTreeMap<PeerId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next expected clock for a peer (0 when the peer is unknown).
    pub fn get(&self, peer: PeerId) -> u64 {
        self.clocks.get(&peer).copied().unwrap_or(0)
    }

    /// Whether the operation is already reflected in this vector.
    pub fn contains(&self, id: OpId) -> bool {
        id.clock < self.get(id.peer)
    }

    /// Advance the peer's clock past the given operation.
    pub fn observe(&mut self, id: OpId) {
        let entry = self.clocks.entry(id.peer).or_insert(0);
        *entry = (*entry).max(id.clock + 1);
    }

    pub fn merge(&mut self, other: &StateVector) {
        for (&peer, &clock) in &other.clocks {
            let entry = self.clocks.entry(peer).or_insert(0);
            *entry = (*entry).max(clock);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, u64)> + '_ {
        self.clocks.iter().map(|(&p, &c)| (p, c))
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        wire::write_var_u64(&mut out, self.clocks.len() as u64);
        for (&peer, &clock) in &self.clocks {
            wire::write_var_u64(&mut out, peer);
            wire::write_var_u64(&mut out, clock);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let sv = Self::decode_from(&mut cursor)?;
        cursor.finish()?;
        Ok(sv)
    }

    pub(crate) fn decode_from(cursor: &mut Cursor<'_>) -> Result<Self> {
        let count = cursor.read_var_u64()?;
        let mut clocks = BTreeMap::new();
        for _ in 0..count {
            let peer = cursor.read_var_u64()?;
            let clock = cursor.read_var_u64()?;
            clocks.insert(peer, clock);
        }
        Ok(Self { clocks })
    }
}

/// Wire names of block scalar fields.
pub mod fields {
    pub const TAG: &str = "tag";
    pub const SUBTYPE: &str = "subtype";
    pub const INDENT: &str = "indent";
    pub const ALIGN: &str = "align";
    pub const COLOR: &str = "color";
}

/// Name of the top-level order sequence root.
pub const ROOT_ORDER: &str = "order";

/// Sub-key within a block an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockPart {
    /// Scalar field map.
    Fields,
    /// Character-run sequence.
    Run,
    /// Child-block sequence of a container block.
    Children,
}

/// Parent linkage of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parent {
    /// The named top-level order sequence ([`ROOT_ORDER`]).
    Root,
    /// Typed content parent plus sub-key.
    Block { block: BlockId, part: BlockPart },
}

impl Parent {
    pub fn block(block: impl Into<BlockId>, part: BlockPart) -> Self {
        Parent::Block {
            block: block.into(),
            part,
        }
    }
}

/// Scalar value of a map-entry operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    UInt(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpBody {
    /// Map entry on a block's scalar fields.
    SetField { key: String, value: Value },
    /// Insertion of a block id into an order or child sequence. `origin` is
    /// the op id of the element this one follows (None = sequence head).
    InsertBlock {
        origin: Option<OpId>,
        block: BlockId,
    },
    /// Insertion of one run token into a block's character-run sequence.
    InsertToken {
        origin: Option<OpId>,
        token: RunToken,
    },
    /// Atomic emptying of the parent sequence; the wire form of `clear()`.
    ClearList,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub id: OpId,
    pub parent: Parent,
    pub body: OpBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_vector_observe_and_contains() {
        let mut sv = StateVector::new();
        assert!(!sv.contains(OpId::new(1, 0)));

        sv.observe(OpId::new(1, 0));
        sv.observe(OpId::new(1, 1));
        assert_eq!(sv.get(1), 2);
        assert!(sv.contains(OpId::new(1, 1)));
        assert!(!sv.contains(OpId::new(1, 2)));
        assert!(!sv.contains(OpId::new(2, 0)));
    }

    #[test]
    fn test_state_vector_observe_is_monotonic() {
        let mut sv = StateVector::new();
        sv.observe(OpId::new(7, 9));
        sv.observe(OpId::new(7, 3));
        assert_eq!(sv.get(7), 10);
    }

    #[test]
    fn test_state_vector_roundtrip() {
        let mut sv = StateVector::new();
        sv.observe(OpId::new(1, 4));
        sv.observe(OpId::new(300, 12));

        let decoded = StateVector::decode(&sv.encode()).unwrap();
        assert_eq!(decoded, sv);
    }

    #[test]
    fn test_state_vector_decode_rejects_trailing_bytes() {
        let mut bytes = StateVector::new().encode();
        bytes.push(0x00);
        assert!(StateVector::decode(&bytes).is_err());
    }

    #[test]
    fn test_state_vector_merge() {
        let mut a = StateVector::new();
        a.observe(OpId::new(1, 5));
        let mut b = StateVector::new();
        b.observe(OpId::new(1, 2));
        b.observe(OpId::new(2, 0));

        a.merge(&b);
        assert_eq!(a.get(1), 6);
        assert_eq!(a.get(2), 1);
    }
}
