//! WebSocket client for collaborative-document servers.
//!
//! The client owns the transport and the single receive loop; every protocol
//! decision lives in [`SyncHandshake`]. The only suspension points are
//! awaiting the next inbound frame and the post-send settle timer (see
//! `session`).

use std::time::Duration;

use async_tungstenite::tokio::{connect_async, ConnectStream};
use async_tungstenite::tungstenite::client::IntoClientRequest;
use async_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use async_tungstenite::WebSocketStream;
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crdt::codec::UpdateFormat;
use crate::crdt::{PeerId, Replica, StateVector};
use crate::error::{Result, SyncError};
use crate::protocol::awareness::{AwarenessEntry, PresenceState};
use crate::protocol::message::Frame;
use crate::protocol::sync::{Step2Compat, SyncHandshake, SyncPhase};

type WsStream = WebSocketStream<ConnectStream>;

/// Default deadline for reaching `Synced`.
pub const DEFAULT_SYNC_DEADLINE: Duration = Duration::from_secs(20);

/// Default settle delay after the last update before closing, giving the
/// peer time to durably persist.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Configuration for connecting to a collaboration server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the document endpoint.
    pub url: String,
    /// One-time bearer token, appended as a query parameter. Obtaining it is
    /// the token collaborator's business, not this crate's.
    pub token: Option<String>,
    pub user_agent: String,
    /// Local peer id; random per connection by default.
    pub peer: PeerId,
    /// Presence announced as the first traffic on the connection.
    pub presence: PresenceState,
    pub sync_deadline: Duration,
    pub settle_delay: Duration,
    pub update_format: UpdateFormat,
    pub step2_compat: Step2Compat,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            user_agent: "blocksync/0.1".to_string(),
            peer: random_peer_id(),
            presence: PresenceState::default(),
            sync_deadline: DEFAULT_SYNC_DEADLINE,
            settle_delay: DEFAULT_SETTLE_DELAY,
            update_format: UpdateFormat::default(),
            step2_compat: Step2Compat::default(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_presence(mut self, presence: PresenceState) -> Self {
        self.presence = presence;
        self
    }

    pub fn with_peer(mut self, peer: PeerId) -> Self {
        self.peer = peer;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.sync_deadline = deadline;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_update_format(mut self, format: UpdateFormat) -> Self {
        self.update_format = format;
        self
    }

    pub fn with_step2_compat(mut self, compat: Step2Compat) -> Self {
        self.step2_compat = compat;
        self
    }

    fn build_url(&self) -> String {
        match &self.token {
            Some(token) => {
                if self.url.contains('?') {
                    format!("{}&token={}", self.url, token)
                } else {
                    format!("{}?token={}", self.url, token)
                }
            }
            None => self.url.clone(),
        }
    }
}

fn random_peer_id() -> PeerId {
    Uuid::new_v4().as_u128() as PeerId
}

/// A client driving one document against one transport connection.
pub struct CollabClient {
    stream: WsStream,
    handshake: SyncHandshake,
    config: ClientConfig,
    /// State vector the peer is known to have, for incremental diffs.
    last_sent: StateVector,
}

impl CollabClient {
    /// Open the transport. A 401/403 on the WebSocket upgrade surfaces as an
    /// authentication error; everything else is a transport error.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let url = config.build_url();
        let mut request = url
            .into_client_request()
            .map_err(|e| SyncError::transport("connect", e))?;
        let agent = config
            .user_agent
            .parse()
            .map_err(|e| SyncError::transport("connect", e))?;
        request.headers_mut().insert("User-Agent", agent);

        let (stream, _response) = connect_async(request).await.map_err(|e| match e {
            WsError::Http(ref resp) if matches!(resp.status().as_u16(), 401 | 403) => {
                SyncError::AuthError(format!("server rejected token: HTTP {}", resp.status()))
            }
            other => SyncError::transport("connect", other),
        })?;
        debug!(url = %config.url, peer = config.peer, "connected");

        let handshake = SyncHandshake::with_formats(config.update_format, config.step2_compat);
        Ok(Self {
            stream,
            handshake,
            config,
            last_sent: StateVector::new(),
        })
    }

    pub fn phase(&self) -> SyncPhase {
        self.handshake.phase()
    }

    pub fn is_synced(&self) -> bool {
        self.handshake.is_synced()
    }

    /// Latest awareness entry per remote peer.
    pub fn peers(&self) -> &std::collections::HashMap<PeerId, AwarenessEntry> {
        self.handshake.peers()
    }

    /// Announce presence, exchange state vectors, and merge the peer's diff.
    ///
    /// The whole sequence runs under the configured deadline; on expiry the
    /// transport is closed and a timeout error is returned — never a hang.
    pub async fn sync(&mut self, replica: &mut Replica) -> Result<()> {
        let deadline = self.config.sync_deadline;
        match tokio::time::timeout(deadline, self.sync_inner(replica)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(?deadline, "sync deadline expired, closing transport");
                let _ = self.stream.close(None).await;
                self.handshake.close();
                Err(SyncError::HandshakeTimeout(deadline))
            }
        }
    }

    async fn sync_inner(&mut self, replica: &mut Replica) -> Result<()> {
        let presence =
            AwarenessEntry::from_presence(self.config.peer, 0, &self.config.presence)?;
        for frame in self.handshake.open(replica, presence)? {
            self.send_frame(&frame).await?;
        }
        while !self.handshake.is_synced() {
            let frame = self.recv_frame().await?.ok_or_else(|| {
                SyncError::transport("sync", "connection closed before sync completed")
            })?;
            for reply in self.handshake.handle_frame(replica, &frame)? {
                self.send_frame(&reply).await?;
            }
        }
        self.last_sent = replica.state_vector().clone();
        Ok(())
    }

    /// Send the diff of everything the peer has not seen as one UPDATE
    /// frame. Call once per completed transaction.
    pub async fn publish(&mut self, replica: &Replica) -> Result<()> {
        if !self.is_synced() {
            return Err(SyncError::ApplicationError(
                "cannot publish before the initial sync".to_string(),
            ));
        }
        if replica.diff(&self.last_sent).is_empty() {
            return Ok(());
        }
        let frame = self.handshake.update_frame(replica, &self.last_sent);
        self.send_frame(&frame).await?;
        self.last_sent = replica.state_vector().clone();
        Ok(())
    }

    /// Process one inbound frame after sync (peer updates, awareness,
    /// pings). Returns false when the peer closed the connection.
    pub async fn receive(&mut self, replica: &mut Replica) -> Result<bool> {
        match self.recv_frame().await? {
            Some(frame) => {
                for reply in self.handshake.handle_frame(replica, &frame)? {
                    self.send_frame(&reply).await?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode();
        let len = encoded.len();
        self.stream
            .send(WsMessage::Binary(encoded.into()))
            .await
            .map_err(|e| SyncError::transport("send", format!("{} ({} byte frame)", e, len)))
    }

    async fn recv_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => return Frame::decode(&data).map(Some),
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                Some(Ok(WsMessage::Ping(data))) => {
                    // Transport-level ping; answer and keep receiving.
                    self.stream
                        .send(WsMessage::Pong(data))
                        .await
                        .map_err(|e| SyncError::transport("receive", e))?;
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Text(_))) => {
                    // The protocol is binary; stray text frames are ignored.
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => return Err(SyncError::transport("receive", e)),
                None => return Ok(None),
            }
        }
    }

    /// Close the connection gracefully.
    pub async fn close(mut self) -> Result<()> {
        self.handshake.close();
        self.stream
            .close(None)
            .await
            .map_err(|e| SyncError::transport("close", e))
    }
}
