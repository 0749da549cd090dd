use thiserror::Error;

#[derive(Error, Debug)]
pub enum TcpError {
    #[error("connection is closed")]
    Closed,

    #[error("listen() called more than once on this server")]
    AlreadyListening,

    #[error("failed to bind listener: {0}")]
    BindFailed(#[source] std::io::Error),

    #[error(transparent)]
    Core(#[from] relaycraft_core::CoreError),
}

pub type Result<T> = std::result::Result<T, TcpError>;
