use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A `{address, port}` pair addressing a TCP host:port on either side of the
/// tunnel. Used both for bound/listening addresses and for SOCKS targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// The local and peer addresses of an established TCP connection. Either
/// field may be absent if unavailable (e.g. the socket failed before the
/// peer address could be queried).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub bound: Option<Endpoint>,
    pub remote: Option<Endpoint>,
}

/// The reason a socket's lifetime ended. Emitted exactly once per socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketCloseKind {
    /// We initiated the close and it completed cleanly.
    WeClosedIt,
    /// The remote end closed the connection.
    RemotelyClosed,
    /// The socket never reached `CONNECTED` (construction or connect failed).
    NeverConnected,
    /// Any other disconnect reason.
    Unknown,
}

/// Lifecycle state of a `TcpConnection`.
///
/// `CONNECTING -> CONNECTED -> CLOSED`; `CONNECTING -> ERROR`;
/// `CONNECTED -> ERROR`. `ERROR` and `CLOSED` are terminal. A connection
/// constructed from an already-accepted socket starts in `CONNECTED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Error)
    }
}

/// Process-global monotonic counter used to mint `TcpConnection` ids
/// (`N7`, ...) and `Session` channel labels (`c0`, `c1`, ...).
///
/// A plain `AtomicU64`; cheap and sufficient since only the ordering of
/// distinct ids matters, not any particular numbering scheme.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Global counter backing `TcpConnection` ids (`N0`, `N1`, ...).
pub static CONNECTION_IDS: IdGenerator = IdGenerator::new();

/// Global counter backing `Session` channel labels (`c0`, `c1`, ...).
pub static CHANNEL_LABELS: IdGenerator = IdGenerator::new();

/// Mint the next connection id, e.g. `N7`.
pub fn next_connection_id() -> String {
    format!("N{}", CONNECTION_IDS.next())
}

/// Mint the next connection id for a socket adopted from the acceptor,
/// e.g. `N7.A42` where `42` is the accepted socket's id.
pub fn next_adopted_connection_id(socket_id: u64) -> String {
    format!("N{}.A{}", CONNECTION_IDS.next(), socket_id)
}

/// Mint the next data-channel label, e.g. `c0`.
pub fn next_channel_label() -> String {
    format!("c{}", CHANNEL_LABELS.next())
}

/// Reserved channel label carrying out-of-band control strings. Must never
/// be dispatched to a `Session`.
pub const CONTROL_CHANNEL_LABEL: &str = "_control_";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_display() {
        let e = Endpoint::new("example.com", 443);
        assert_eq!(e.to_string(), "example.com:443");
    }

    #[test]
    fn connection_state_terminal() {
        assert!(!ConnectionState::Connecting.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Error.is_terminal());
    }

    #[test]
    fn id_generator_is_monotonic() {
        let gen = IdGenerator::new();
        let a = gen.next();
        let b = gen.next();
        let c = gen.next();
        assert_eq!((a, b, c), (0, 1, 2));
    }

    #[test]
    fn connection_ids_are_unique_across_calls() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert_ne!(a, b);
        assert!(a.starts_with('N'));
    }

    #[test]
    fn adopted_connection_id_carries_socket_suffix() {
        let id = next_adopted_connection_id(42);
        assert!(id.contains(".A42"));
    }

    #[test]
    fn channel_labels_are_unique_across_calls() {
        let a = next_channel_label();
        let b = next_channel_label();
        assert_ne!(a, b);
        assert!(a.starts_with('c'));
    }
}
