//! The `PeerConnection` trait — a bidirectional peer transport reachable
//! only through `open_data_channel`, `send(label, data)`, `data_from_peer`,
//! channel-open/-closed signals, lifetime signals, and a signalling message
//! stream. No core module depends on which implementation is wired in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use relaycraft_core::{HandlerQueue, SocketCloseKind};

use crate::error::Result;
use crate::frame::DataFrame;

/// A frame received from the peer, tagged with the data-channel label it
/// arrived on.
#[derive(Debug, Clone)]
pub struct PeerFrame {
    pub label: String,
    pub frame: DataFrame,
}

/// Opaque out-of-band message used to negotiate the peer connection; not
/// interpreted by the core. Transport of these messages is the embedder's
/// responsibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignallingMessage(pub String);

/// A bidirectional transport carrying multiple labeled data channels, each
/// carrying discrete frames that are either binary buffers or text.
/// Implemented by `Libp2pPeerConnection` (production) and
/// `LoopbackPeerConnection` (in-process test double).
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Begin negotiating the underlying transport. May be called at most
    /// once.
    async fn negotiate_connection(&self) -> Result<()>;

    /// Resolves once the connection is usable, or fails.
    async fn once_connected(&self) -> std::result::Result<(), String>;

    /// Resolves exactly once when the peer connection's lifetime ends.
    async fn once_disconnected(&self) -> SocketCloseKind;

    /// Open a new data channel under `label`. Resolves once the channel is
    /// open on both sides.
    async fn open_data_channel(&self, label: &str) -> Result<()>;

    /// Close a previously-opened data channel.
    async fn close_data_channel(&self, label: &str);

    /// Resolves exactly once when the named channel closes, from either
    /// side.
    async fn once_channel_closed(&self, label: &str) -> SocketCloseKind;

    /// Send one frame on the named channel.
    async fn send(&self, label: &str, frame: DataFrame) -> Result<()>;

    /// The queue of frames arriving from the peer, tagged by channel label.
    /// The reserved label `_control_` carries out-of-band control strings
    /// and must not be dispatched to any session.
    fn data_from_peer(&self) -> HandlerQueue<PeerFrame, ()>;

    /// Deliver a signalling message received from the embedder's transport.
    async fn handle_signal_from_peer(&self, msg: SignallingMessage) -> Result<()>;

    /// The queue of outbound signalling messages this connection wants
    /// relayed to its peer via the embedder's transport.
    fn signals_for_peer(&self) -> HandlerQueue<SignallingMessage, ()>;

    /// Tear the connection down. Idempotent.
    async fn close(&self) -> SocketCloseKind;
}
