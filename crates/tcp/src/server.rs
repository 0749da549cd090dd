//! `TcpServer` — bind, accept, connection registry, admission control,
//! graceful shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use relaycraft_core::{Endpoint, HandlerQueue, OnceSignal, SocketCloseKind};

use crate::connection::TcpConnection;
use crate::error::{Result, TcpError};

/// Hard cap on the connection registry absent an explicit override.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1_048_576;

struct Inner {
    configured_endpoint: Endpoint,
    bound_endpoint: Mutex<Option<Endpoint>>,
    max_connections: usize,
    registry: Mutex<HashMap<u64, TcpConnection>>,
    connections_queue: HandlerQueue<TcpConnection, ()>,
    next_socket_id: AtomicU64,
    once_listening: OnceSignal<std::result::Result<Endpoint, String>>,
    once_shutdown: OnceSignal<SocketCloseKind>,
    listen_called: Mutex<bool>,
    shutdown_started: Mutex<bool>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

/// Accepts SOCKS5 clients (or any TCP client) on one bound endpoint,
/// tracking every accepted connection until it closes.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<Inner>,
}

impl TcpServer {
    pub fn new(endpoint: Endpoint, max_connections: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                configured_endpoint: endpoint,
                bound_endpoint: Mutex::new(None),
                max_connections: max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
                registry: Mutex::new(HashMap::new()),
                connections_queue: HandlerQueue::new(),
                next_socket_id: AtomicU64::new(0),
                once_listening: OnceSignal::new(),
                once_shutdown: OnceSignal::new(),
                listen_called: Mutex::new(false),
                shutdown_started: Mutex::new(false),
                listener_task: Mutex::new(None),
            }),
        }
    }

    /// The queue of accepted connections; install a handler with
    /// `connections_queue().set_sync_handler(...)` to consume them.
    pub fn connections_queue(&self) -> &HandlerQueue<TcpConnection, ()> {
        &self.inner.connections_queue
    }

    /// Bind the configured endpoint. May be called at most once. Port `0`
    /// resolves to the kernel-assigned port, which becomes the server's
    /// reported bound endpoint.
    pub async fn listen(&self) -> Result<Endpoint> {
        {
            let mut called = self.inner.listen_called.lock().await;
            if *called {
                return Err(TcpError::AlreadyListening);
            }
            *called = true;
        }

        let bind_addr = (
            self.inner.configured_endpoint.address.as_str(),
            self.inner.configured_endpoint.port,
        );
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                self.inner.once_listening.fire(Err(e.to_string())).await;
                self.inner
                    .once_shutdown
                    .fire(SocketCloseKind::NeverConnected)
                    .await;
                return Err(TcpError::BindFailed(e));
            }
        };

        let local = listener.local_addr().map_err(TcpError::BindFailed)?;
        let resolved = Endpoint::new(local.ip().to_string(), local.port());
        *self.inner.bound_endpoint.lock().await = Some(resolved.clone());
        self.inner.once_listening.fire(Ok(resolved.clone())).await;

        let accept_inner = self.inner.clone();
        let handle = tokio::spawn(async move { accept_loop(accept_inner, listener).await });
        *self.inner.listener_task.lock().await = Some(handle);

        Ok(resolved)
    }

    pub async fn once_listening(&self) -> std::result::Result<Endpoint, String> {
        self.inner.once_listening.wait().await
    }

    pub async fn once_shutdown(&self) -> SocketCloseKind {
        self.inner.once_shutdown.wait().await
    }

    pub async fn is_listening(&self) -> bool {
        *self.inner.listen_called.lock().await && !self.is_shutdown().await
    }

    pub async fn is_shutdown(&self) -> bool {
        self.inner.once_shutdown.is_fired().await
    }

    pub async fn connections(&self) -> Vec<TcpConnection> {
        self.inner.registry.lock().await.values().cloned().collect()
    }

    pub async fn connections_count(&self) -> usize {
        self.inner.registry.lock().await.len()
    }

    /// Close the listening socket only, without touching registered
    /// connections.
    pub async fn stop_listening(&self) {
        if let Some(handle) = self.inner.listener_task.lock().await.take() {
            handle.abort();
        }
        self.inner
            .once_shutdown
            .fire(SocketCloseKind::WeClosedIt)
            .await;
    }

    /// Close every registered connection and wait for each to finish
    /// closing.
    pub async fn close_all(&self) {
        let conns = self.connections().await;
        for conn in conns {
            conn.close().await;
        }
    }

    /// `stop_listening()` then `close_all()`. Mandatory order: the listener
    /// must stop accepting before the registry is drained, or a new arrival
    /// could race a registry iteration.
    pub async fn shutdown(&self) {
        {
            let mut started = self.inner.shutdown_started.lock().await;
            if *started {
                return;
            }
            *started = true;
        }
        self.stop_listening().await;
        self.close_all().await;
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let socket_id = inner.next_socket_id.fetch_add(1, Ordering::Relaxed);

                if inner.registry.lock().await.len() >= inner.max_connections {
                    debug!(
                        socket_id,
                        %peer_addr,
                        "admission limit reached, destroying socket without enqueueing"
                    );
                    drop(stream);
                    continue;
                }

                let conn = TcpConnection::adopt(stream, socket_id).await;
                inner
                    .registry
                    .lock()
                    .await
                    .insert(socket_id, conn.clone());

                let cleanup_inner = inner.clone();
                let cleanup_conn = conn.clone();
                tokio::spawn(async move {
                    cleanup_conn.once_closed().await;
                    cleanup_inner.registry.lock().await.remove(&socket_id);
                });

                if inner.connections_queue.handle(conn).await.is_err() {
                    debug!("connections queue closed while dispatching an accepted socket");
                }
            }
            Err(e) => {
                warn!(error = %e, "accept() failed");
            }
        }
    }
}
