//! Awareness: the auxiliary presence channel alongside document sync.
//!
//! Awareness state is ephemeral and needs no conflict resolution; each entry
//! is a peer id, a logical clock, and an opaque UTF-8 payload (JSON here).
//! Announcing presence is the mandatory first traffic on a new connection,
//! before any sync frame.

use serde::{Deserialize, Serialize};

use crate::crdt::PeerId;
use crate::error::{Result, SyncError};
use crate::wire::{self, Cursor};

/// One wire entry of an AWARENESS frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub peer: PeerId,
    pub clock: u64,
    pub payload: String,
}

impl AwarenessEntry {
    pub fn new(peer: PeerId, clock: u64, payload: impl Into<String>) -> Self {
        Self {
            peer,
            clock,
            payload: payload.into(),
        }
    }

    /// Entry carrying a serialized presence state.
    pub fn from_presence(peer: PeerId, clock: u64, state: &PresenceState) -> Result<Self> {
        Ok(Self::new(peer, clock, serde_json::to_string(state)?))
    }

    /// Parse the payload as presence state.
    pub fn presence(&self) -> Result<PresenceState> {
        serde_json::from_str(&self.payload).map_err(SyncError::from)
    }

    pub(crate) fn encode_to(&self, out: &mut Vec<u8>) {
        wire::write_var_u64(out, self.peer);
        wire::write_var_u64(out, self.clock);
        wire::write_string(out, &self.payload);
    }

    pub(crate) fn decode_from(cursor: &mut Cursor<'_>) -> Result<Self> {
        let peer = cursor.read_var_u64()?;
        let clock = cursor.read_var_u64()?;
        let payload = cursor.read_string()?;
        Ok(Self {
            peer,
            clock,
            payload,
        })
    }
}

/// Presence payload shared with other editors of the document.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PresenceState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,

    /// Id of the block this peer currently focuses, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
}

/// User identification shown next to remote cursors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserInfo {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl PresenceState {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            user: Some(UserInfo {
                name: name.into(),
                color: None,
            }),
            focus: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Frame;

    #[test]
    fn test_entry_roundtrip_via_frame() {
        let entries = vec![
            AwarenessEntry::new(1, 0, r#"{"user":{"name":"Alice"}}"#),
            AwarenessEntry::new(900, 4, "{}"),
        ];
        let frame = Frame::awareness(entries.clone());
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, Frame::Awareness(entries));
    }

    #[test]
    fn test_presence_payload_roundtrip() {
        let state = PresenceState {
            user: Some(UserInfo {
                name: "Alice".into(),
                color: Some("#ff0000".into()),
            }),
            focus: Some("block-3".into()),
        };
        let entry = AwarenessEntry::from_presence(7, 0, &state).unwrap();
        assert_eq!(entry.presence().unwrap(), state);
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let entry = AwarenessEntry::from_presence(1, 0, &PresenceState::named("Bob")).unwrap();
        assert!(!entry.payload.contains("color"));
        assert!(!entry.payload.contains("focus"));
    }

    #[test]
    fn test_truncated_entry_is_error() {
        // One entry declared, payload length runs past the buffer.
        let bytes = [0x01, 0x01, 0x02, 0x00, 0x09, b'{'];
        assert!(Frame::decode(&bytes).is_err());
    }
}
