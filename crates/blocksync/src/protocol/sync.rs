//! Sync handshake state machine.
//!
//! Sans-IO: the machine owns no socket. `open()` produces the frames that
//! start a session and `handle_frame()` produces the replies to each inbound
//! frame; one receive loop (see `client`) moves bytes. Phases:
//!
//! ```text
//! Connecting -> AwaitingPeerStep1 -> AwaitingPeerStep2 -> Synced
//!                     (Closed reachable from any phase)
//! ```

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::crdt::codec::{self, UpdateFormat};
use crate::crdt::{PeerId, Replica, StateVector};
use crate::error::{Result, SyncError};

use super::awareness::AwarenessEntry;
use super::message::{Frame, SyncFrame};

/// Handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    /// Transport not yet announced; no traffic sent.
    #[default]
    Connecting,
    /// Presence and local STEP1 sent; waiting for the peer's STEP1.
    AwaitingPeerStep1,
    /// Peer's STEP1 answered; waiting for the peer's STEP2 diff.
    AwaitingPeerStep2,
    /// Initial exchange complete; incremental updates flow.
    Synced,
    /// Terminal, after success or error.
    Closed,
}

/// Encoding strategy for STEP2 replies.
///
/// The reference peer only accepts legacy-encoded STEP2 payloads, whatever
/// encoding the session otherwise uses — a peer quirk, not a protocol rule,
/// so it stays configurable instead of hard-coded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Step2Compat {
    /// Always reply in the legacy sub-encoding (reference peer behavior).
    #[default]
    ForceLegacy,
    /// Reply in whatever format the session uses for updates.
    Negotiated,
}

/// Drives one transport session through presence announcement, state-vector
/// exchange, and incremental updates.
#[derive(Debug)]
pub struct SyncHandshake {
    phase: SyncPhase,
    update_format: UpdateFormat,
    step2_compat: Step2Compat,
    /// Latest awareness entry seen per peer.
    peers: HashMap<PeerId, AwarenessEntry>,
}

impl Default for SyncHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncHandshake {
    pub fn new() -> Self {
        Self::with_formats(UpdateFormat::default(), Step2Compat::default())
    }

    pub fn with_formats(update_format: UpdateFormat, step2_compat: Step2Compat) -> Self {
        Self {
            phase: SyncPhase::Connecting,
            update_format,
            step2_compat,
            peers: HashMap::new(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn is_synced(&self) -> bool {
        self.phase == SyncPhase::Synced
    }

    /// Latest awareness entry per remote peer.
    pub fn peers(&self) -> &HashMap<PeerId, AwarenessEntry> {
        &self.peers
    }

    /// Frames that open a session: the presence announcement — mandatory
    /// first traffic, before any sync frame — followed by the local STEP1.
    pub fn open(&mut self, replica: &Replica, presence: AwarenessEntry) -> Result<Vec<Frame>> {
        if self.phase != SyncPhase::Connecting {
            return Err(SyncError::ApplicationError(format!(
                "handshake already opened (phase {:?})",
                self.phase
            )));
        }
        self.phase = SyncPhase::AwaitingPeerStep1;
        debug!(peer = presence.peer, "announcing presence and requesting diff");
        Ok(vec![
            Frame::awareness(vec![presence]),
            Frame::step1(replica.state_vector()),
        ])
    }

    /// Process one inbound frame; returns the frames to send in response.
    pub fn handle_frame(&mut self, replica: &mut Replica, frame: &Frame) -> Result<Vec<Frame>> {
        if self.phase == SyncPhase::Closed {
            return Err(SyncError::ApplicationError(
                "handshake is closed".to_string(),
            ));
        }
        match frame {
            // Answered immediately regardless of phase.
            Frame::Ping => Ok(vec![Frame::Pong]),
            Frame::Pong => Ok(vec![]),
            Frame::Awareness(entries) => {
                for entry in entries {
                    let newer = self
                        .peers
                        .get(&entry.peer)
                        .map_or(true, |seen| entry.clock >= seen.clock);
                    if newer {
                        self.peers.insert(entry.peer, entry.clone());
                    }
                }
                Ok(vec![])
            }
            Frame::Sync(SyncFrame::Step1(sv_bytes)) => {
                let peer_sv = StateVector::decode(sv_bytes)?;
                let diff = replica.diff(&peer_sv);
                let format = self.step2_format();
                debug!(
                    ops = diff.len(),
                    format = format.name(),
                    "answering state-vector request"
                );
                if self.phase == SyncPhase::AwaitingPeerStep1 {
                    self.phase = SyncPhase::AwaitingPeerStep2;
                }
                Ok(vec![Frame::step2(codec::encode_update(&diff, format))])
            }
            Frame::Sync(SyncFrame::Step2(bytes)) => {
                let update = codec::decode_update(bytes)?;
                let applied = replica.apply(&update);
                debug!(applied, "merged peer diff; sync complete");
                self.phase = SyncPhase::Synced;
                Ok(vec![])
            }
            Frame::Sync(SyncFrame::Update(bytes)) => {
                let update = codec::decode_update(bytes)?;
                let applied = replica.apply(&update);
                if !self.is_synced() {
                    warn!(applied, "update received before sync completed");
                }
                Ok(vec![])
            }
        }
    }

    /// Wrap a diff since `since` as an UPDATE frame in the session's update
    /// format. Used once per outbound transaction after reaching `Synced`.
    pub fn update_frame(&self, replica: &Replica, since: &StateVector) -> Frame {
        let diff = replica.diff(since);
        Frame::update(codec::encode_update(&diff, self.update_format))
    }

    /// Encoding used for STEP2 replies under the configured strategy.
    pub fn step2_format(&self) -> UpdateFormat {
        match self.step2_compat {
            Step2Compat::ForceLegacy => UpdateFormat::Legacy,
            Step2Compat::Negotiated => self.update_format,
        }
    }

    /// Move to the terminal phase.
    pub fn close(&mut self) {
        self.phase = SyncPhase::Closed;
    }
}
