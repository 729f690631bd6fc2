//! High-level write and read entry points.
//!
//! The write path returns a structured [`WriteOutcome`] instead of an error,
//! so batch callers continue past one failed document.

use tracing::debug;

use crate::client::{ClientConfig, CollabClient};
use crate::crdt::{import_document, PeerId, Replica, Transaction};
use crate::doc::Document;
use crate::error::{Result, SyncError};
use crate::protocol::awareness::AwarenessEntry;

/// Result of one write operation.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl WriteOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(err: &SyncError) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
        }
    }
}

/// Replace the remote document's content with `document`.
///
/// Connects, syncs, then runs one transaction that clears the merged state
/// and re-emits the supplied blocks; the diff goes out as a single update.
/// A settle delay follows the send — peers may need time to durably persist
/// before the socket drops.
pub async fn write_document(config: ClientConfig, document: &Document) -> WriteOutcome {
    match write_inner(config, document).await {
        Ok(()) => WriteOutcome::ok(),
        Err(e) => WriteOutcome::failed(&e),
    }
}

async fn write_inner(config: ClientConfig, document: &Document) -> Result<()> {
    if document.is_empty() {
        return Err(SyncError::ApplicationError(
            "document has no blocks".to_string(),
        ));
    }
    let peer = config.peer;
    let settle = config.settle_delay;

    let mut client = CollabClient::connect(config).await?;
    let mut replica = Replica::new(peer);
    client.sync(&mut replica).await?;

    replica.transact(|tx| {
        tx.clear();
        import_document(tx, document);
    });
    client.publish(&replica).await?;
    debug!(blocks = document.len(), "document written, settling");

    tokio::time::sleep(settle).await;
    client.close().await
}

/// A live editing session: one replica bound to one connection.
pub struct CollabSession {
    client: CollabClient,
    replica: Replica,
}

impl CollabSession {
    /// Connect and complete the initial sync.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let peer = config.peer;
        let mut client = CollabClient::connect(config).await?;
        let mut replica = Replica::new(peer);
        client.sync(&mut replica).await?;
        Ok(Self { client, replica })
    }

    pub fn doc(&self) -> &Document {
        self.replica.doc()
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Latest awareness entry per remote peer.
    pub fn peers(&self) -> &std::collections::HashMap<PeerId, AwarenessEntry> {
        self.client.peers()
    }

    /// Run one transaction and publish its diff as one update.
    pub async fn commit<R>(&mut self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> Result<R> {
        let out = self.replica.transact(f);
        self.client.publish(&self.replica).await?;
        Ok(out)
    }

    /// Process one inbound frame. Returns false when the peer closed the
    /// connection.
    pub async fn receive(&mut self) -> Result<bool> {
        self.client.receive(&mut self.replica).await
    }

    pub async fn close(self) -> Result<()> {
        self.client.close().await
    }
}
