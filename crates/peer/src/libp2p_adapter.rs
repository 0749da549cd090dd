//! `Libp2pPeerConnection` — the production `PeerConnection`, built on
//! `libp2p` (`tokio`, `noise`, `yamux`, `identify`, `relay`, `dcutr`), with
//! `libp2p-stream` opening one substream per data channel. Two endpoints
//! only: one dials or listens for the other, then every data channel is a
//! substream distinguished by a label header, not by protocol id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{AsyncReadExt, StreamExt};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{dcutr, identify, noise, relay, tcp, yamux, Multiaddr, PeerId, StreamProtocol, SwarmBuilder};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use relaycraft_core::{HandlerQueue, OnceSignal, SocketCloseKind};

use crate::connection::{PeerConnection, PeerFrame, SignallingMessage};
use crate::error::{PeerError, Result};
use crate::frame::{read_frame, read_label, write_frame, write_label, DataFrame};

/// The single libp2p-stream protocol every data channel multiplexes over;
/// channels are distinguished by the label header each substream opens
/// with, not by protocol id.
const CHANNEL_PROTOCOL: StreamProtocol = StreamProtocol::new("/relaycraft/channel/1.0.0");

type BoxedWriter = Box<dyn futures::io::AsyncWrite + Unpin + Send>;

/// How this side of the connection finds its peer: dial out, or listen and
/// accept the first inbound connection.
pub enum RemotePeer {
    Dial(Multiaddr),
    Listen(Multiaddr),
}

pub struct Libp2pConfig {
    pub keypair: libp2p::identity::Keypair,
    pub remote: RemotePeer,
    /// Both settings currently negotiate the same noise-secured transport;
    /// the obfuscation layer itself is out of scope here. Kept so a future
    /// obfuscating transport upgrade has a flag to switch on.
    pub obfuscate: bool,
}

#[derive(NetworkBehaviour)]
struct RelayBehaviour {
    identify: identify::Behaviour,
    relay_client: relay::client::Behaviour,
    dcutr: dcutr::Behaviour,
    stream: libp2p_stream::Behaviour,
}

struct Shared {
    stream_control: Mutex<Option<libp2p_stream::Control>>,
    remote_peer: OnceSignal<PeerId>,
    writers: Mutex<HashMap<String, BoxedWriter>>,
    channel_closed: Mutex<HashMap<String, Arc<OnceSignal<SocketCloseKind>>>>,
    data_from_peer: HandlerQueue<PeerFrame, ()>,
    signals_for_peer: HandlerQueue<SignallingMessage, ()>,
    once_connected: OnceSignal<std::result::Result<(), String>>,
    once_disconnected: OnceSignal<SocketCloseKind>,
    negotiated: Mutex<bool>,
}

impl Shared {
    async fn channel_signal(&self, label: &str) -> Arc<OnceSignal<SocketCloseKind>> {
        self.channel_closed
            .lock()
            .await
            .entry(label.to_string())
            .or_insert_with(|| Arc::new(OnceSignal::new()))
            .clone()
    }
}

/// A production peer connection backed by a libp2p swarm running on its own
/// background task.
pub struct Libp2pPeerConnection {
    shared: Arc<Shared>,
    config: Mutex<Option<Libp2pConfig>>,
}

impl Libp2pPeerConnection {
    pub fn new(config: Libp2pConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                stream_control: Mutex::new(None),
                remote_peer: OnceSignal::new(),
                writers: Mutex::new(HashMap::new()),
                channel_closed: Mutex::new(HashMap::new()),
                data_from_peer: HandlerQueue::new(),
                signals_for_peer: HandlerQueue::new(),
                once_connected: OnceSignal::new(),
                once_disconnected: OnceSignal::new(),
                negotiated: Mutex::new(false),
            }),
            config: Mutex::new(Some(config)),
        }
    }

    fn build_swarm(keypair: libp2p::identity::Keypair) -> Result<libp2p::Swarm<RelayBehaviour>> {
        let swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| PeerError::Transport(e.to_string()))?
            .with_relay_client(noise::Config::new, yamux::Config::default)
            .map_err(|e| PeerError::Transport(e.to_string()))?
            .with_behaviour(|key, relay_behaviour| {
                Ok(RelayBehaviour {
                    identify: identify::Behaviour::new(identify::Config::new(
                        "/relaycraft/1.0.0".to_string(),
                        key.public(),
                    )),
                    relay_client: relay_behaviour,
                    dcutr: dcutr::Behaviour::new(key.public().to_peer_id()),
                    stream: libp2p_stream::Behaviour::new(),
                })
            })
            .map_err(|e| PeerError::Transport(e.to_string()))?
            .build();
        Ok(swarm)
    }
}

#[async_trait]
impl PeerConnection for Libp2pPeerConnection {
    async fn negotiate_connection(&self) -> Result<()> {
        {
            let mut negotiated = self.shared.negotiated.lock().await;
            if *negotiated {
                return Err(PeerError::AlreadyNegotiated);
            }
            *negotiated = true;
        }

        let config = self
            .config
            .lock()
            .await
            .take()
            .ok_or(PeerError::AlreadyNegotiated)?;

        if config.obfuscate {
            debug!("obfuscate requested; noise-secured transport used either way");
        }

        let mut swarm = Self::build_swarm(config.keypair)?;
        let stream_control = swarm.behaviour().stream.new_control();
        let incoming = stream_control
            .clone()
            .accept(CHANNEL_PROTOCOL)
            .map_err(|e| PeerError::Transport(e.to_string()))?;
        *self.shared.stream_control.lock().await = Some(stream_control);

        match &config.remote {
            RemotePeer::Dial(addr) => {
                swarm
                    .dial(addr.clone())
                    .map_err(|e| PeerError::Transport(e.to_string()))?;
            }
            RemotePeer::Listen(addr) => {
                swarm
                    .listen_on(addr.clone())
                    .map_err(|e| PeerError::Transport(e.to_string()))?;
            }
        }

        let shared = self.shared.clone();
        tokio::spawn(async move { drive_swarm(shared, swarm).await });

        let accept_shared = self.shared.clone();
        tokio::spawn(async move { accept_loop(accept_shared, incoming).await });

        Ok(())
    }

    async fn once_connected(&self) -> std::result::Result<(), String> {
        self.shared.once_connected.wait().await
    }

    async fn once_disconnected(&self) -> SocketCloseKind {
        self.shared.once_disconnected.wait().await
    }

    async fn open_data_channel(&self, label: &str) -> Result<()> {
        let peer_id = self.shared.remote_peer.wait().await;
        let mut control = self
            .shared
            .stream_control
            .lock()
            .await
            .clone()
            .ok_or(PeerError::NotConnected)?;

        let mut stream = control
            .open_stream(peer_id, CHANNEL_PROTOCOL)
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;
        write_label(&mut stream, label)
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;

        let (mut reader, writer) = stream.split();
        self.shared
            .writers
            .lock()
            .await
            .insert(label.to_string(), Box::new(writer));

        let shared = self.shared.clone();
        let label = label.to_string();
        tokio::spawn(async move { read_channel_loop(shared, label, &mut reader).await });

        Ok(())
    }

    async fn close_data_channel(&self, label: &str) {
        self.shared.writers.lock().await.remove(label);
        self.shared
            .channel_signal(label)
            .await
            .fire(SocketCloseKind::WeClosedIt)
            .await;
    }

    async fn once_channel_closed(&self, label: &str) -> SocketCloseKind {
        self.shared.channel_signal(label).await.wait().await
    }

    async fn send(&self, label: &str, frame: DataFrame) -> Result<()> {
        let mut writers = self.shared.writers.lock().await;
        let writer = writers
            .get_mut(label)
            .ok_or_else(|| PeerError::UnknownChannel(label.to_string()))?;
        write_frame(writer, &frame)
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))
    }

    fn data_from_peer(&self) -> HandlerQueue<PeerFrame, ()> {
        self.shared.data_from_peer.clone()
    }

    async fn handle_signal_from_peer(&self, msg: SignallingMessage) -> Result<()> {
        debug!(signal = %msg.0, "signal from peer (transport negotiation is out of scope)");
        Ok(())
    }

    fn signals_for_peer(&self) -> HandlerQueue<SignallingMessage, ()> {
        self.shared.signals_for_peer.clone()
    }

    async fn close(&self) -> SocketCloseKind {
        self.shared.writers.lock().await.clear();
        self.shared
            .once_disconnected
            .fire(SocketCloseKind::WeClosedIt)
            .await;
        self.shared.once_disconnected.wait().await
    }
}

async fn drive_swarm(shared: Arc<Shared>, mut swarm: libp2p::Swarm<RelayBehaviour>) {
    loop {
        match swarm.select_next_some().await {
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                info!(%peer_id, "peer connection established");
                shared.remote_peer.fire(peer_id).await;
                shared.once_connected.fire(Ok(())).await;
            }
            SwarmEvent::OutgoingConnectionError { error, .. } => {
                warn!(%error, "failed to dial peer");
                shared.once_connected.fire(Err(error.to_string())).await;
                shared
                    .once_disconnected
                    .fire(SocketCloseKind::NeverConnected)
                    .await;
                return;
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                info!(%peer_id, "peer connection closed");
                shared
                    .once_disconnected
                    .fire(SocketCloseKind::RemotelyClosed)
                    .await;
                return;
            }
            other => {
                debug!(?other, "swarm event");
            }
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, mut incoming: libp2p_stream::IncomingStreams) {
    while let Some((_peer_id, mut stream)) = incoming.next().await {
        let label = match read_label(&mut stream).await {
            Ok(label) => label,
            Err(e) => {
                warn!(error = %e, "failed to read data-channel label header");
                continue;
            }
        };

        let (mut reader, writer) = stream.split();
        shared
            .writers
            .lock()
            .await
            .insert(label.clone(), Box::new(writer));

        let shared = shared.clone();
        tokio::spawn(async move { read_channel_loop(shared, label, &mut reader).await });
    }
}

async fn read_channel_loop<R: futures::io::AsyncRead + Unpin>(
    shared: Arc<Shared>,
    label: String,
    reader: &mut R,
) {
    loop {
        match read_frame(reader).await {
            Ok(Some(frame)) => {
                let _ = shared
                    .data_from_peer
                    .handle(PeerFrame {
                        label: label.clone(),
                        frame,
                    })
                    .await;
            }
            Ok(None) => {
                shared.writers.lock().await.remove(&label);
                shared
                    .channel_signal(&label)
                    .await
                    .fire(SocketCloseKind::RemotelyClosed)
                    .await;
                return;
            }
            Err(e) => {
                warn!(%label, error = %e, "data-channel read error");
                shared.writers.lock().await.remove(&label);
                shared
                    .channel_signal(&label)
                    .await
                    .fire(SocketCloseKind::Unknown)
                    .await;
                return;
            }
        }
    }
}
