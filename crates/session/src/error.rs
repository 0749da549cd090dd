use thiserror::Error;

/// Errors surfaced by a `Session`. All are terminal to the session: each
/// path that produces one also closes the session.
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("failed to open data channel: {0}")]
    ChannelOpenFailed(String),

    #[error("SOCKS5 handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("peer sent a malformed endpoint reply")]
    MalformedEndpoint,

    #[error("expected a textual frame from the peer, got a binary frame")]
    UnexpectedFrameKind,

    #[error("the TCP connection or data channel closed before the session became ready")]
    ClosedBeforeReady,

    #[error("failed to write to the TCP connection: {0}")]
    TcpWriteFailed(String),

    #[error("failed to send the request to the peer: {0}")]
    PeerSendFailed(String),
}
