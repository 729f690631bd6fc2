//! Wire protocol: frame discriminators, awareness entries, and the sync
//! handshake state machine.

pub mod awareness;
pub mod message;
pub mod sync;

pub use awareness::{AwarenessEntry, PresenceState, UserInfo};
pub use message::{Frame, SyncFrame};
pub use sync::{Step2Compat, SyncHandshake, SyncPhase};
