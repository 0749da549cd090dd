use thiserror::Error;

/// Errors surfaced by `Relay::start`. All are terminal: each fails
/// `once_ready` and initiates shutdown.
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("start() called more than once")]
    AlreadyStarted,

    #[error("failed to bind the TCP server: {0}")]
    ListenFailed(String),

    #[error("failed to negotiate the peer connection: {0}")]
    NegotiationFailed(String),
}
