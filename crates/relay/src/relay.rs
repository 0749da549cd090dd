//! `Relay` — composition root owning one `TcpServer` and one
//! `PeerConnection`, routing inbound peer data to sessions by channel label
//! and tearing the whole thing down deterministically when either leg fails.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use relaycraft_core::{Endpoint, HandlerQueue, OnceSignal, CONTROL_CHANNEL_LABEL};
use relaycraft_peer::{PeerConnection, PeerFrame, SignallingMessage};
use relaycraft_session::{ByteCounters, Session};
use relaycraft_tcp::{TcpConnection, TcpServer};

use crate::error::RelayError;

struct Inner {
    server: TcpServer,
    peer: Arc<dyn PeerConnection>,
    sessions: Mutex<HashMap<String, Session>>,
    signals_for_peer: HandlerQueue<SignallingMessage, ()>,
    counters: ByteCounters,
    started: Mutex<bool>,
    stopping: Mutex<bool>,
    once_ready: OnceSignal<Result<Endpoint, RelayError>>,
    once_stopped: OnceSignal<()>,
}

/// The top-level composition owning the TCP server, the peer connection, and
/// all active sessions.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

impl Relay {
    pub fn new(server: TcpServer, peer: Arc<dyn PeerConnection>) -> Self {
        Self {
            inner: Arc::new(Inner {
                server,
                peer,
                sessions: Mutex::new(HashMap::new()),
                signals_for_peer: HandlerQueue::new(),
                counters: ByteCounters::default(),
                started: Mutex::new(false),
                stopping: Mutex::new(false),
                once_ready: OnceSignal::new(),
                once_stopped: OnceSignal::new(),
            }),
        }
    }

    /// Construct a `TcpServer` for `endpoint` and wire it to `peer`. Does not
    /// start the relay; call `start()` afterward.
    pub fn bind(endpoint: Endpoint, max_connections: Option<usize>, peer: Arc<dyn PeerConnection>) -> Self {
        Self::new(TcpServer::new(endpoint, max_connections), peer)
    }

    pub fn bytes_received_from_peer(&self) -> u64 {
        self.inner
            .counters
            .received_from_peer
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn bytes_sent_to_peer(&self) -> u64 {
        self.inner
            .counters
            .sent_to_peer
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// The queue of outbound signalling messages the embedder should relay to
    /// the peer.
    pub fn signals_for_peer(&self) -> HandlerQueue<SignallingMessage, ()> {
        self.inner.signals_for_peer.clone()
    }

    /// Deliver a signalling message received from the embedder's transport.
    pub async fn handle_signal_from_peer(&self, msg: SignallingMessage) -> relaycraft_peer::Result<()> {
        self.inner.peer.handle_signal_from_peer(msg).await
    }

    /// May be called at most once. Wires up data/signal routing, negotiates
    /// the peer connection, and races the TCP listener and peer connect
    /// against each other toward `once_ready`.
    pub async fn start(&self) -> Result<(), RelayError> {
        {
            let mut started = self.inner.started.lock().await;
            if *started {
                return Err(RelayError::AlreadyStarted);
            }
            *started = true;
        }

        install_accept_handler(self.inner.clone()).await;
        install_peer_data_router(self.inner.clone()).await;
        install_peer_signal_forwarder(self.inner.clone()).await;

        if let Err(e) = self.inner.peer.negotiate_connection().await {
            let inner = self.inner.clone();
            let message = e.to_string();
            tokio::spawn(async move {
                inner.once_ready.fire(Err(RelayError::NegotiationFailed(message))).await;
                initiate_shutdown(inner).await;
            });
            return Ok(());
        }

        let ready_inner = self.inner.clone();
        tokio::spawn(async move { drive_readiness(ready_inner).await });

        let stop_inner = self.inner.clone();
        tokio::spawn(async move { watch_for_stop(stop_inner).await });

        Ok(())
    }

    /// Resolves once the TCP server is listening and the peer connection is
    /// usable, with the server's bound endpoint, or fails.
    pub async fn once_ready(&self) -> Result<Endpoint, RelayError> {
        self.inner.once_ready.wait().await
    }

    /// Resolves exactly once, after a single shutdown has completed.
    pub async fn once_stopped(&self) {
        self.inner.once_stopped.wait().await
    }

    /// Idempotent. Initiates shutdown and awaits its completion.
    pub async fn stop(&self) {
        initiate_shutdown(self.inner.clone()).await;
    }
}

async fn drive_readiness(inner: Arc<Inner>) {
    let (listen_result, connect_result) = tokio::join!(inner.server.listen(), inner.peer.once_connected());

    match (listen_result, connect_result) {
        (Ok(endpoint), Ok(())) => {
            inner.once_ready.fire(Ok(endpoint)).await;
        }
        (Ok(_), Err(e)) => {
            inner.once_ready.fire(Err(RelayError::NegotiationFailed(e))).await;
            initiate_shutdown(inner).await;
        }
        (Err(e), _) => {
            inner.once_ready.fire(Err(RelayError::ListenFailed(e.to_string()))).await;
            initiate_shutdown(inner).await;
        }
    }
}

async fn watch_for_stop(inner: Arc<Inner>) {
    tokio::select! {
        _ = inner.server.once_shutdown() => {}
        _ = inner.peer.once_disconnected() => {}
    }
    initiate_shutdown(inner).await;
}

async fn initiate_shutdown(inner: Arc<Inner>) {
    {
        let mut stopping = inner.stopping.lock().await;
        if *stopping {
            return;
        }
        *stopping = true;
    }

    tokio::join!(inner.server.shutdown(), async {
        inner.peer.close().await;
    });

    let sessions: Vec<Session> = inner.sessions.lock().await.values().cloned().collect();
    for session in sessions {
        session.close().await;
    }

    inner.once_stopped.fire(()).await;
}

async fn install_accept_handler(inner: Arc<Inner>) {
    let queue = inner.server.connections_queue().clone();
    let handler_inner = inner.clone();
    let _ = queue
        .set_sync_handler(move |tcp: TcpConnection| {
            let inner = handler_inner.clone();
            async move {
                let session = Session::spawn(tcp, inner.peer.clone(), inner.counters.clone());
                let label = session.channel_label().to_string();
                inner.sessions.lock().await.insert(label.clone(), session.clone());

                let cleanup_inner = inner.clone();
                let cleanup_session = session;
                tokio::spawn(async move {
                    cleanup_session.once_closed().await;
                    cleanup_inner.sessions.lock().await.remove(&label);
                });
            }
        })
        .await;
}

async fn install_peer_data_router(inner: Arc<Inner>) {
    let queue = inner.peer.data_from_peer();
    let router_inner = inner.clone();
    let _ = queue
        .set_sync_handler(move |frame: PeerFrame| {
            let inner = router_inner.clone();
            async move {
                if frame.label == CONTROL_CHANNEL_LABEL {
                    debug!(label = %frame.label, "control-channel frame discarded");
                    return;
                }
                let session = inner.sessions.lock().await.get(&frame.label).cloned();
                match session {
                    Some(session) => {
                        let _ = session.peer_inbound().handle(frame.frame).await;
                    }
                    None => {
                        debug!(label = %frame.label, "data for unknown channel label discarded");
                    }
                }
            }
        })
        .await;
}

async fn install_peer_signal_forwarder(inner: Arc<Inner>) {
    let queue = inner.peer.signals_for_peer();
    let forward_inner = inner.clone();
    let _ = queue
        .set_sync_handler(move |msg: SignallingMessage| {
            let inner = forward_inner.clone();
            async move {
                let _ = inner.signals_for_peer.handle(msg).await;
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use relaycraft_peer::{DataFrame, LoopbackPeerConnection};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn happy_path_relay_reaches_ready_and_forwards_a_round_trip() {
        let (client_peer, egress_peer) = LoopbackPeerConnection::pair();
        egress_peer.negotiate_connection().await.unwrap();
        let egress_peer = Arc::new(egress_peer);

        // A trivial egress emulator: echo every textual request back as an
        // endpoint reply, then loop any binary frame back to its sender.
        let echo_peer = egress_peer.clone();
        tokio::spawn(async move {
            loop {
                let frame = match echo_peer
                    .data_from_peer()
                    .set_sync_next_handler(|frame: PeerFrame| async move { frame })
                    .await
                {
                    Ok(fut) => match fut.await {
                        Ok(frame) => frame,
                        Err(_) => return,
                    },
                    Err(_) => return,
                };
                match frame.frame {
                    DataFrame::Str(text) => {
                        #[derive(serde::Deserialize, serde::Serialize)]
                        struct Req {
                            host: String,
                            port: u16,
                        }
                        let req: Req = serde_json::from_str(&text).unwrap();
                        let endpoint = Endpoint::new(req.host, req.port);
                        let _ = echo_peer
                            .send(&frame.label, DataFrame::Str(serde_json::to_string(&endpoint).unwrap()))
                            .await;
                    }
                    DataFrame::Buffer(buf) => {
                        let _ = echo_peer.send(&frame.label, DataFrame::Buffer(buf)).await;
                    }
                }
            }
        });

        let relay = Relay::bind(Endpoint::new("127.0.0.1", 0), None, Arc::new(client_peer));
        relay.start().await.unwrap();
        let bound = relay.once_ready().await.unwrap();

        let mut client = TcpStream::connect((bound.address.as_str(), bound.port)).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut auth_reply = [0u8; 2];
        client.read_exact(&mut auth_reply).await.unwrap();
        assert_eq!(auth_reply, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut success_reply = [0u8; 10];
        client.read_exact(&mut success_reply).await.unwrap();
        assert_eq!(success_reply[0..4], [0x05, 0x00, 0x00, 0x03]);

        client.write_all(b"PING").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"PING");

        assert_eq!(relay.session_count().await, 1);
        assert_eq!(relay.bytes_sent_to_peer(), 4);
        assert_eq!(relay.bytes_received_from_peer(), 4);

        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(relay.session_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_peer_reply_fails_session_without_success_reply() {
        let (client_peer, egress_peer) = LoopbackPeerConnection::pair();
        egress_peer.negotiate_connection().await.unwrap();

        let relay = Relay::bind(Endpoint::new("127.0.0.1", 0), None, Arc::new(client_peer));
        relay.start().await.unwrap();
        let bound = relay.once_ready().await.unwrap();

        tokio::spawn(async move {
            let frame = egress_peer
                .data_from_peer()
                .set_sync_next_handler(|frame: PeerFrame| async move { frame })
                .await
                .unwrap()
                .await
                .unwrap();
            let _ = egress_peer
                .send(&frame.label, DataFrame::Buffer(Bytes::from_static(b"not json")))
                .await;
        });

        let mut client = TcpStream::connect((bound.address.as_str(), bound.port)).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut auth_reply = [0u8; 2];
        client.read_exact(&mut auth_reply).await.unwrap();
        assert_eq!(auth_reply, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "client should observe socket closed, not a success reply");
    }

    #[tokio::test]
    async fn admission_drop_caps_session_count() {
        let (client_peer, _egress_peer) = LoopbackPeerConnection::pair();
        let relay = Relay::bind(Endpoint::new("127.0.0.1", 0), Some(1), Arc::new(client_peer));
        relay.start().await.unwrap();
        let bound = relay.once_ready().await.unwrap();

        let _c1 = TcpStream::connect((bound.address.as_str(), bound.port)).await.unwrap();
        let _c2 = TcpStream::connect((bound.address.as_str(), bound.port)).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(relay.session_count().await <= 1);
    }
}
