//! # blocksync
//!
//! CRDT sync client and codec for collaborative block documents.
//!
//! ## What it does
//!
//! - **Document model**: ordered block tree with character runs and inline
//!   formatting ([`Document`], [`Block`], [`CharacterRun`])
//! - **CRDT codec**: operation-based updates under two wire sub-encodings,
//!   decoded through a fallback cascade ([`crdt::codec`])
//! - **Protocol**: frame layer (sync, awareness, ping/pong) and the sync
//!   handshake state machine ([`protocol`])
//! - **Client**: WebSocket transport with a bounded sync deadline, plus a
//!   structured-result write path (`client`, `session`, feature `client`)
//! - **Renderer**: decoded documents to grouped, nested semantic markup
//!   ([`render`])
//!
//! ## Example
//!
//! ```rust
//! use blocksync::{BlockAttrs, BlockTag, HtmlRenderer, Replica};
//!
//! let mut replica = Replica::new(1);
//! replica.transact(|tx| {
//!     let p = tx.append_block(BlockTag::Paragraph, BlockAttrs::default());
//!     tx.append_text(&p, "Hello").unwrap();
//! });
//!
//! let html = HtmlRenderer::new().render(replica.doc());
//! assert_eq!(html, "<p>Hello</p>");
//! ```

pub mod crdt;
pub mod doc;
pub mod error;
pub mod protocol;
pub mod render;
pub mod wire;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "client")]
pub mod session;

pub use crdt::codec::UpdateFormat;
pub use crdt::{import_document, Op, OpId, PeerId, Replica, StateVector, Transaction, Update};
pub use doc::{
    Alignment, Block, BlockAttrs, BlockContent, BlockId, BlockTag, CharacterRun, Document,
    IdGenerator, InlineAttr, RunToken, SequentialIds, Span, UuidIds,
};
pub use error::{Result, SyncError};
pub use protocol::{
    AwarenessEntry, Frame, PresenceState, Step2Compat, SyncFrame, SyncHandshake, SyncPhase,
    UserInfo,
};
pub use render::{render_snapshot, HtmlRenderer};

#[cfg(feature = "client")]
pub use client::{ClientConfig, CollabClient};

#[cfg(feature = "client")]
pub use session::{write_document, CollabSession, WriteOutcome};
