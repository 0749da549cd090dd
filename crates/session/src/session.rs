//! `Session` — one accepted SOCKS5 client paired to one data channel on the
//! peer connection. Construction kicks off an async
//! handshake sequence in a background task; the `Session` handle returned to
//! the caller exposes only the lifecycle signals (`once_ready`,
//! `once_closed`) and `close()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::warn;

use relaycraft_core::{Endpoint, HandlerQueue, OnceSignal};
use relaycraft_peer::{DataFrame, PeerConnection};
use relaycraft_tcp::TcpConnection;

use crate::error::SessionError;
use crate::socks5;

/// Byte counters a `Session` reports into as it forwards data, shared with
/// whichever `Relay` owns it so bandwidth can be aggregated across sessions.
#[derive(Clone, Default)]
pub struct ByteCounters {
    pub sent_to_peer: Arc<AtomicU64>,
    pub received_from_peer: Arc<AtomicU64>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct WireConnectRequest {
    host: String,
    port: u16,
}

struct Inner {
    label: String,
    tcp: TcpConnection,
    peer: Arc<dyn PeerConnection>,
    peer_inbound: HandlerQueue<DataFrame, ()>,
    data_channel_closed: Mutex<bool>,
    closing: Mutex<bool>,
    once_ready: OnceSignal<Result<Endpoint, SessionError>>,
    once_closed: OnceSignal<()>,
}

/// A live (or settling) tunnel between one accepted SOCKS5 connection and one
/// peer data channel.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Construct a session over `tcp` using a fresh channel label on `peer`,
    /// and spawn its handshake/forwarding task. Returns immediately; await
    /// `once_ready()` to learn whether the tunnel came up.
    pub fn spawn(tcp: TcpConnection, peer: Arc<dyn PeerConnection>, counters: ByteCounters) -> Self {
        let label = relaycraft_core::next_channel_label();
        let inner = Arc::new(Inner {
            label,
            tcp,
            peer,
            peer_inbound: HandlerQueue::new(),
            data_channel_closed: Mutex::new(false),
            closing: Mutex::new(false),
            once_ready: OnceSignal::new(),
            once_closed: OnceSignal::new(),
        });

        let run_inner = inner.clone();
        tokio::spawn(async move { run(run_inner, counters).await });

        Self { inner }
    }

    pub fn channel_label(&self) -> &str {
        &self.inner.label
    }

    /// The queue a `Relay` feeds this session's share of `dataFromPeer` into,
    /// keyed by this session's channel label.
    pub fn peer_inbound(&self) -> HandlerQueue<DataFrame, ()> {
        self.inner.peer_inbound.clone()
    }

    /// Resolves once the handshake with the client and peer completes (with
    /// the endpoint the peer connected to), or fails.
    pub async fn once_ready(&self) -> Result<Endpoint, SessionError> {
        self.inner.once_ready.wait().await
    }

    /// Resolves exactly once, after both the TCP leg and the data channel
    /// have closed.
    pub async fn once_closed(&self) {
        self.inner.once_closed.wait().await
    }

    /// Idempotent. Closes both legs.
    pub async fn close(&self) {
        close_session(&self.inner).await;
    }
}

async fn fail(inner: &Arc<Inner>, err: SessionError) {
    inner.once_ready.fire(Err(err)).await;
    close_session(inner).await;
}

async fn run(inner: Arc<Inner>, counters: ByteCounters) {
    watch_legs(inner.clone());

    tokio::select! {
        _ = handshake(inner.clone(), counters) => {}
        _ = inner.tcp.once_closed() => {
            fail(&inner, SessionError::ClosedBeforeReady).await;
        }
        _ = inner.peer.once_channel_closed(&inner.label) => {
            fail(&inner, SessionError::ClosedBeforeReady).await;
        }
    }
}

/// Watches both legs for the rest of the session's life so closing either
/// one independently still tears the session down.
fn watch_legs(inner: Arc<Inner>) {
    let tcp_inner = inner.clone();
    tokio::spawn(async move {
        tcp_inner.tcp.once_closed().await;
        close_session(&tcp_inner).await;
    });
    let peer_inner = inner.clone();
    tokio::spawn(async move {
        peer_inner.peer.once_channel_closed(&peer_inner.label).await;
        close_session(&peer_inner).await;
    });
}

async fn handshake(inner: Arc<Inner>, counters: ByteCounters) {
    let (open_result, greeting_result) =
        tokio::join!(inner.peer.open_data_channel(&inner.label), inner.tcp.receive_next());

    if let Err(e) = open_result {
        fail(&inner, SessionError::ChannelOpenFailed(e.to_string())).await;
        return;
    }
    let greeting_buf = match greeting_result {
        Ok(buf) => buf,
        Err(e) => {
            fail(&inner, SessionError::TcpWriteFailed(e.to_string())).await;
            return;
        }
    };

    if let Err(e) = socks5::parse_greeting(&greeting_buf) {
        warn!(label = %inner.label, error = %e, "malformed SOCKS5 greeting");
        let _ = inner
            .tcp
            .send(Bytes::copy_from_slice(&socks5::no_acceptable_methods_reply()))
            .await;
        fail(&inner, SessionError::HandshakeFailed(e.to_string())).await;
        return;
    }
    if let Err(e) = inner.tcp.send(Bytes::copy_from_slice(&socks5::no_auth_reply())).await {
        fail(&inner, SessionError::TcpWriteFailed(e.to_string())).await;
        return;
    }

    let request_buf = match inner.tcp.receive_next().await {
        Ok(buf) => buf,
        Err(e) => {
            fail(&inner, SessionError::TcpWriteFailed(e.to_string())).await;
            return;
        }
    };
    let request = match socks5::parse_connect_request(&request_buf) {
        Ok(r) => r,
        Err(e) => {
            warn!(label = %inner.label, error = %e, "malformed SOCKS5 request");
            fail(&inner, SessionError::HandshakeFailed(e.to_string())).await;
            return;
        }
    };

    let wire_request = WireConnectRequest {
        host: request.host,
        port: request.port,
    };
    let payload = match serde_json::to_string(&wire_request) {
        Ok(s) => s,
        Err(e) => {
            fail(&inner, SessionError::PeerSendFailed(e.to_string())).await;
            return;
        }
    };
    if let Err(e) = inner.peer.send(&inner.label, DataFrame::Str(payload)).await {
        fail(&inner, SessionError::PeerSendFailed(e.to_string())).await;
        return;
    }

    let next = match inner
        .peer_inbound
        .set_sync_next_handler(|frame: DataFrame| async move { frame })
        .await
    {
        Ok(f) => f,
        Err(e) => {
            fail(&inner, SessionError::PeerSendFailed(e.to_string())).await;
            return;
        }
    };
    let reply_frame = match next.await {
        Ok(frame) => frame,
        Err(_) => {
            fail(&inner, SessionError::ClosedBeforeReady).await;
            return;
        }
    };

    let endpoint: Endpoint = match reply_frame {
        DataFrame::Str(text) => match serde_json::from_str(&text) {
            Ok(ep) => ep,
            Err(_) => {
                fail(&inner, SessionError::MalformedEndpoint).await;
                return;
            }
        },
        DataFrame::Buffer(_) => {
            fail(&inner, SessionError::UnexpectedFrameKind).await;
            return;
        }
    };

    let reply_bytes = socks5::success_reply(&endpoint);
    if let Err(e) = inner.tcp.send(Bytes::from(reply_bytes)).await {
        fail(&inner, SessionError::TcpWriteFailed(e.to_string())).await;
        return;
    }

    inner.once_ready.fire(Ok(endpoint)).await;
    install_forwarders(inner, counters);
}

fn install_forwarders(inner: Arc<Inner>, counters: ByteCounters) {
    let tcp_to_peer_inner = inner.clone();
    let tcp_to_peer_counters = counters.clone();
    tokio::spawn(async move {
        loop {
            match tcp_to_peer_inner.tcp.receive_next().await {
                Ok(buf) => {
                    let len = buf.len() as u64;
                    match tcp_to_peer_inner
                        .peer
                        .send(&tcp_to_peer_inner.label, DataFrame::Buffer(buf))
                        .await
                    {
                        Ok(()) => {
                            tcp_to_peer_counters
                                .sent_to_peer
                                .fetch_add(len, Ordering::Relaxed);
                        }
                        Err(_) => break,
                    }
                }
                Err(_) => break,
            }
        }
    });

    let peer_to_tcp_inner = inner.clone();
    let peer_to_tcp_counters = counters;
    tokio::spawn(async move {
        let _ = peer_to_tcp_inner
            .peer_inbound
            .set_sync_handler(move |frame: DataFrame| {
                let inner = peer_to_tcp_inner.clone();
                let counters = peer_to_tcp_counters.clone();
                async move {
                    match frame {
                        DataFrame::Buffer(buf) => {
                            let len = buf.len() as u64;
                            if inner.tcp.send(buf).await.is_ok() {
                                counters.received_from_peer.fetch_add(len, Ordering::Relaxed);
                            }
                        }
                        DataFrame::Str(_) => {
                            warn!(label = %inner.label, "dropping non-binary frame after handshake");
                        }
                    }
                }
            })
            .await;
    });
}

async fn close_session(inner: &Arc<Inner>) {
    {
        let mut closing = inner.closing.lock().await;
        if *closing {
            return;
        }
        *closing = true;
    }

    if !inner.tcp.is_closed().await {
        inner.tcp.close().await;
    }

    let already_closed = {
        let mut flag = inner.data_channel_closed.lock().await;
        let was = *flag;
        *flag = true;
        was
    };
    if !already_closed {
        inner.peer.close_data_channel(&inner.label).await;
    }

    inner.once_closed.fire(()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycraft_peer::LoopbackPeerConnection;
    use tokio::net::{TcpListener, TcpStream};

    async fn client_pair() -> (TcpConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        (TcpConnection::adopt(accepted, 0).await, client)
    }

    #[tokio::test]
    async fn happy_path_reaches_ready_and_forwards_bytes_both_ways() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (tcp, mut client) = client_pair().await;
        let (local_peer, remote_peer) = LoopbackPeerConnection::pair();
        local_peer.negotiate_connection().await.unwrap();
        remote_peer.negotiate_connection().await.unwrap();
        let remote_peer: Arc<dyn PeerConnection> = Arc::new(remote_peer);

        let session = Session::spawn(tcp, Arc::new(local_peer), ByteCounters::default());

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut auth_reply = [0u8; 2];
        client.read_exact(&mut auth_reply).await.unwrap();
        assert_eq!(auth_reply, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let request_frame = remote_peer
            .data_from_peer()
            .set_sync_next_handler(|frame| async move { frame })
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(request_frame.label, session.channel_label());
        match request_frame.frame {
            DataFrame::Str(text) => {
                let parsed: WireConnectRequest = serde_json::from_str(&text).unwrap();
                assert_eq!(parsed.host, "example.com");
                assert_eq!(parsed.port, 80);
            }
            DataFrame::Buffer(_) => panic!("expected textual request frame"),
        }

        let endpoint = Endpoint::new("example.com", 80);
        remote_peer
            .send(
                session.channel_label(),
                DataFrame::Str(serde_json::to_string(&endpoint).unwrap()),
            )
            .await
            .unwrap();

        let ready = session.once_ready().await.unwrap();
        assert_eq!(ready, endpoint);

        let mut success_reply = [0u8; 10];
        client.read_exact(&mut success_reply).await.unwrap();
        assert_eq!(success_reply[0..4], [0x05, 0x00, 0x00, 0x03]);

        client.write_all(b"hello from client").await.unwrap();
        let forwarded = remote_peer
            .data_from_peer()
            .set_sync_next_handler(|frame| async move { frame })
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(forwarded.frame, DataFrame::Buffer(Bytes::from_static(b"hello from client")));

        remote_peer
            .send(session.channel_label(), DataFrame::Buffer(Bytes::from_static(b"hi back")))
            .await
            .unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi back");
    }

    #[tokio::test]
    async fn malformed_greeting_fails_ready_and_closes_session() {
        use tokio::io::AsyncWriteExt;

        let (tcp, mut client) = client_pair().await;
        let (local_peer, _remote_peer) = LoopbackPeerConnection::pair();
        local_peer.negotiate_connection().await.unwrap();

        let session = Session::spawn(tcp, Arc::new(local_peer), ByteCounters::default());

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        let err = session.once_ready().await.unwrap_err();
        assert!(matches!(err, SessionError::HandshakeFailed(_)));
        session.once_closed().await;
    }
}
