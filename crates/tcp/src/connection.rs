//! `TcpConnection` — lifecycle plus duplex byte stream over one accepted or
//! dialed socket. Two construction variants, adopt and dial, are modeled as
//! two constructors rather than a runtime-checked sum type: Rust's type
//! system already rules out the "neither or both supplied" misuse that a
//! runtime-checked variant would have to guard against.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use relaycraft_core::{
    next_adopted_connection_id, next_connection_id, ConnectionInfo, ConnectionState, Endpoint,
    HandlerQueue, OnceSignal, SocketCloseKind,
};

use crate::error::Result;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// The result of a single write offered to a `TcpConnection`'s outbound
/// queue: either the number of bytes written, or the I/O error that
/// occurred.
#[derive(Debug, Clone)]
pub struct WriteInfo {
    pub bytes_written: usize,
    pub error: Option<String>,
}

struct Inner {
    state: Mutex<ConnectionState>,
    inbound: HandlerQueue<Bytes, Bytes>,
    outbound: HandlerQueue<Bytes, WriteInfo>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    paused_tx: watch::Sender<bool>,
    paused_rx: watch::Receiver<bool>,
    once_connected: OnceSignal<std::result::Result<ConnectionInfo, String>>,
    once_closed: OnceSignal<SocketCloseKind>,
    connect_task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn new(state: ConnectionState) -> Arc<Self> {
        let (paused_tx, paused_rx) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(state),
            inbound: HandlerQueue::new(),
            outbound: HandlerQueue::new(),
            write_half: Mutex::new(None),
            paused_tx,
            paused_rx,
            once_connected: OnceSignal::new(),
            once_closed: OnceSignal::new(),
            connect_task: Mutex::new(None),
        })
    }

    /// Split the now-connected socket, install the outbound write handler,
    /// and spawn the inbound read loop.
    async fn activate(self: &Arc<Self>, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        *self.write_half.lock().await = Some(write_half);

        let inner = self.clone();
        self.outbound
            .set_sync_handler(move |buf: Bytes| {
                let inner = inner.clone();
                async move { inner.write_buf(buf).await }
            })
            .await
            .expect("outbound handler installed exactly once per connection");

        let read_inner = self.clone();
        tokio::spawn(async move {
            read_loop(read_inner, read_half).await;
        });
    }

    async fn write_buf(&self, buf: Bytes) -> WriteInfo {
        let mut guard = self.write_half.lock().await;
        match guard.as_mut() {
            Some(w) => match w.write_all(&buf).await {
                Ok(()) => WriteInfo {
                    bytes_written: buf.len(),
                    error: None,
                },
                Err(e) => WriteInfo {
                    bytes_written: 0,
                    error: Some(e.to_string()),
                },
            },
            None => WriteInfo {
                bytes_written: 0,
                error: Some("socket already closed".to_string()),
            },
        }
    }

    /// The single path by which a connection's lifetime ends. Idempotent:
    /// a second disconnect while already terminal is logged and ignored.
    async fn disconnect(self: &Arc<Self>, kind: SocketCloseKind) {
        {
            let mut state = self.state.lock().await;
            if state.is_terminal() {
                debug!(?kind, "duplicate disconnect event ignored");
                return;
            }
            *state = if matches!(kind, SocketCloseKind::NeverConnected) {
                ConnectionState::Error
            } else {
                ConnectionState::Closed
            };
        }
        self.outbound.clear().await;
        self.outbound.stop_handling().await;
        *self.write_half.lock().await = None;
        // No-op if onceConnected already fulfilled by a successful connect.
        self.once_connected
            .fire(Err("connection closed before connect completed".to_string()))
            .await;
        self.once_closed.fire(kind).await;
    }
}

fn endpoint_from(addr: SocketAddr) -> Endpoint {
    Endpoint::new(addr.ip().to_string(), addr.port())
}

fn connection_info(stream: &TcpStream) -> ConnectionInfo {
    ConnectionInfo {
        bound: stream.local_addr().ok().map(endpoint_from),
        remote: stream.peer_addr().ok().map(endpoint_from),
    }
}

async fn read_loop(inner: Arc<Inner>, mut read_half: tokio::net::tcp::OwnedReadHalf) {
    let mut paused_rx = inner.paused_rx.clone();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        if *paused_rx.borrow() {
            if paused_rx.changed().await.is_err() {
                return;
            }
            continue;
        }
        tokio::select! {
            changed = paused_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        inner.disconnect(SocketCloseKind::RemotelyClosed).await;
                        return;
                    }
                    Ok(n) => {
                        let _ = inner.inbound.handle(Bytes::copy_from_slice(&buf[..n])).await;
                    }
                    Err(_) => {
                        inner.disconnect(SocketCloseKind::Unknown).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Lifecycle plus duplex byte stream over one TCP socket.
#[derive(Clone)]
pub struct TcpConnection {
    id: Arc<str>,
    inner: Arc<Inner>,
}

impl TcpConnection {
    /// Wrap an already-accepted socket. State begins `CONNECTED`.
    pub async fn adopt(stream: TcpStream, socket_id: u64) -> Self {
        let id: Arc<str> = next_adopted_connection_id(socket_id).into();
        let inner = Inner::new(ConnectionState::Connected);
        let info = connection_info(&stream);
        inner.activate(stream).await;
        inner.once_connected.fire(Ok(info)).await;
        Self { id, inner }
    }

    /// Dial out to `endpoint`. State begins `CONNECTING`. The
    /// socket is paused the instant the connect attempt lands, before the
    /// endpoints are queried, closing the window where inbound bytes could
    /// arrive before a consumer is attached; it is resumed afterward unless
    /// `start_paused` was requested.
    pub fn dial(endpoint: Endpoint, start_paused: bool) -> Self {
        let id: Arc<str> = next_connection_id().into();
        let inner = Inner::new(ConnectionState::Connecting);
        let conn = Self {
            id: id.clone(),
            inner: inner.clone(),
        };

        let task_inner = inner.clone();
        let handle = tokio::spawn(async move {
            let _ = task_inner.paused_tx.send(true);
            match TcpStream::connect((endpoint.address.as_str(), endpoint.port)).await {
                Ok(stream) => {
                    let info = connection_info(&stream);
                    task_inner.activate(stream).await;
                    *task_inner.state.lock().await = ConnectionState::Connected;
                    task_inner.once_connected.fire(Ok(info)).await;
                    if !start_paused {
                        let _ = task_inner.paused_tx.send(false);
                    }
                }
                Err(e) => {
                    task_inner.once_connected.fire(Err(e.to_string())).await;
                    task_inner.disconnect(SocketCloseKind::NeverConnected).await;
                }
            }
        });
        // Stored so `close()` during CONNECTING can cut the in-flight dial
        // short rather than letting it race a later, pointless activation.
        if let Ok(mut guard) = inner.connect_task.try_lock() {
            *guard = Some(handle);
        }

        conn
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.lock().await
    }

    pub async fn is_closed(&self) -> bool {
        *self.inner.state.lock().await == ConnectionState::Closed
    }

    /// Resolves once to the connection's local/remote endpoints, or fails.
    pub async fn once_connected(&self) -> std::result::Result<ConnectionInfo, String> {
        self.inner.once_connected.wait().await
    }

    /// Resolves exactly once with the reason the connection's lifetime
    /// ended.
    pub async fn once_closed(&self) -> SocketCloseKind {
        self.inner.once_closed.wait().await
    }

    /// Enqueue `buf` for writing. Sends offered before connect completes
    /// are buffered and flushed in order once the outbound handler installs.
    pub async fn send(&self, buf: Bytes) -> Result<WriteInfo> {
        if self.inner.state.lock().await.is_terminal() {
            return Err(crate::error::TcpError::Closed);
        }
        Ok(self.inner.outbound.handle(buf).await?)
    }

    /// Await the next inbound buffer.
    pub async fn receive_next(&self) -> Result<Bytes> {
        let fut = self
            .inner
            .inbound
            .set_sync_next_handler(|buf: Bytes| async move { buf })
            .await?;
        Ok(fut.await?)
    }

    pub fn pause(&self) {
        let _ = self.inner.paused_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.inner.paused_tx.send(false);
    }

    /// Idempotent. Requests the socket close and returns the close kind
    /// once fulfilled.
    pub async fn close(&self) -> SocketCloseKind {
        if let Some(handle) = self.inner.connect_task.lock().await.take() {
            handle.abort();
        }
        if !self.inner.state.lock().await.is_terminal() {
            self.inner.disconnect(SocketCloseKind::WeClosedIt).await;
        }
        self.inner.once_closed.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpConnection, TcpConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial = TcpConnection::dial(Endpoint::new(addr.ip().to_string(), addr.port()), false);
        let (accepted, _) = listener.accept().await.unwrap();
        let server_side = TcpConnection::adopt(accepted, 0).await;
        dial.once_connected().await.unwrap();
        (dial, server_side)
    }

    #[tokio::test]
    async fn adopt_starts_connected_and_resolves_once_connected() {
        let (dial, server_side) = loopback_pair().await;
        assert_eq!(server_side.state().await, ConnectionState::Connected);
        assert_eq!(dial.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn bytes_sent_arrive_in_order() {
        let (dial, server_side) = loopback_pair().await;
        dial.send(Bytes::from_static(b"hello ")).await.unwrap();
        dial.send(Bytes::from_static(b"world")).await.unwrap();
        let first = server_side.receive_next().await.unwrap();
        assert_eq!(&first[..], b"hello ");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fulfills_once_closed_exactly_once() {
        let (dial, _server_side) = loopback_pair().await;
        let first = dial.close().await;
        let second = dial.close().await;
        assert_eq!(first, SocketCloseKind::WeClosedIt);
        assert_eq!(second, SocketCloseKind::WeClosedIt);
        assert!(dial.is_closed().await);
    }

    #[tokio::test]
    async fn remote_close_is_observed_as_remotely_closed() {
        let (dial, server_side) = loopback_pair().await;
        server_side.close().await;
        assert_eq!(dial.once_closed().await, SocketCloseKind::RemotelyClosed);
    }

    #[tokio::test]
    async fn dial_failure_rejects_once_connected_and_resolves_never_connected() {
        // Port 0 never accepts real connections once bound+dropped; instead
        // dial an address nothing listens on, on the loopback interface, to
        // force an immediate connection-refused error deterministically.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dial = TcpConnection::dial(Endpoint::new(addr.ip().to_string(), addr.port()), false);
        assert!(dial.once_connected().await.is_err());
        assert_eq!(dial.once_closed().await, SocketCloseKind::NeverConnected);
        assert_eq!(dial.state().await, ConnectionState::Error);
    }

    #[tokio::test]
    async fn closing_during_connecting_still_fulfills_once_closed_exactly_once() {
        // A non-routable address keeps the connect attempt pending so close()
        // races it while still CONNECTING.
        let dial = TcpConnection::dial(Endpoint::new("10.255.255.1", 80), false);
        let kind = dial.close().await;
        assert_eq!(kind, SocketCloseKind::WeClosedIt);
        assert!(dial.once_connected().await.is_err());
    }

    #[tokio::test]
    async fn send_after_close_is_refused() {
        let (dial, _server_side) = loopback_pair().await;
        dial.close().await;
        let result = dial.send(Bytes::from_static(b"too late")).await;
        assert!(result.is_err());
    }
}
