//! `LoopbackPeerConnection` — two instances wired to each other's queues,
//! used by the `tests` crate to exercise `Relay`/`Session` logic
//! deterministically without any real transport. Plays the role the
//! spec's "peer-connection stub" plays in the end-to-end scenarios.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use relaycraft_core::{HandlerQueue, OnceSignal, SocketCloseKind};

use crate::connection::{PeerConnection, PeerFrame, SignallingMessage};
use crate::error::Result;
use crate::frame::DataFrame;

struct Shared {
    data_from_peer: HandlerQueue<PeerFrame, ()>,
    signals_for_peer: HandlerQueue<SignallingMessage, ()>,
    channel_closed: Mutex<HashMap<String, Arc<OnceSignal<SocketCloseKind>>>>,
    once_connected: OnceSignal<std::result::Result<(), String>>,
    once_disconnected: OnceSignal<SocketCloseKind>,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            data_from_peer: HandlerQueue::new(),
            signals_for_peer: HandlerQueue::new(),
            channel_closed: Mutex::new(HashMap::new()),
            once_connected: OnceSignal::new(),
            once_disconnected: OnceSignal::new(),
        })
    }

    async fn channel_signal(&self, label: &str) -> Arc<OnceSignal<SocketCloseKind>> {
        self.channel_closed
            .lock()
            .await
            .entry(label.to_string())
            .or_insert_with(|| Arc::new(OnceSignal::new()))
            .clone()
    }
}

/// One side of a wired loopback pair. `send()` on this side enqueues
/// straight into the other side's `data_from_peer`.
pub struct LoopbackPeerConnection {
    local: Arc<Shared>,
    remote: Arc<Shared>,
}

impl LoopbackPeerConnection {
    /// Construct two ends already wired to each other.
    pub fn pair() -> (Self, Self) {
        let a = Shared::new();
        let b = Shared::new();
        (
            Self {
                local: a.clone(),
                remote: b.clone(),
            },
            Self { local: b, remote: a },
        )
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeerConnection {
    async fn negotiate_connection(&self) -> Result<()> {
        self.local.once_connected.fire(Ok(())).await;
        Ok(())
    }

    async fn once_connected(&self) -> std::result::Result<(), String> {
        self.local.once_connected.wait().await
    }

    async fn once_disconnected(&self) -> SocketCloseKind {
        self.local.once_disconnected.wait().await
    }

    async fn open_data_channel(&self, _label: &str) -> Result<()> {
        Ok(())
    }

    async fn close_data_channel(&self, label: &str) {
        self.local
            .channel_signal(label)
            .await
            .fire(SocketCloseKind::WeClosedIt)
            .await;
        self.remote
            .channel_signal(label)
            .await
            .fire(SocketCloseKind::RemotelyClosed)
            .await;
    }

    async fn once_channel_closed(&self, label: &str) -> SocketCloseKind {
        self.local.channel_signal(label).await.wait().await
    }

    async fn send(&self, label: &str, frame: DataFrame) -> Result<()> {
        let _ = self
            .remote
            .data_from_peer
            .handle(PeerFrame {
                label: label.to_string(),
                frame,
            })
            .await;
        Ok(())
    }

    fn data_from_peer(&self) -> HandlerQueue<PeerFrame, ()> {
        self.local.data_from_peer.clone()
    }

    async fn handle_signal_from_peer(&self, msg: SignallingMessage) -> Result<()> {
        let _ = self.remote.signals_for_peer.handle(msg).await;
        Ok(())
    }

    fn signals_for_peer(&self) -> HandlerQueue<SignallingMessage, ()> {
        self.local.signals_for_peer.clone()
    }

    async fn close(&self) -> SocketCloseKind {
        self.local.once_disconnected.fire(SocketCloseKind::WeClosedIt).await;
        self.remote
            .once_disconnected
            .fire(SocketCloseKind::RemotelyClosed)
            .await;
        self.local.once_disconnected.wait().await
    }
}
