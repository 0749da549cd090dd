use thiserror::Error;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("negotiate_connection() called more than once")]
    AlreadyNegotiated,

    #[error("no data channel is open under label {0:?}")]
    UnknownChannel(String),

    #[error("peer connection is not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Core(#[from] relaycraft_core::CoreError),
}

pub type Result<T> = std::result::Result<T, PeerError>;
