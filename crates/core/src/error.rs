use thiserror::Error;

/// Errors raised by `relaycraft-core` primitives, chiefly `HandlerQueue`
/// misuse. Downstream crates wrap this into their own error enums via
/// `#[from]` rather than matching on it directly.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A permanent handler was already installed on this queue; the queue
    /// is single-consumer, so installing a second one is a programmer error.
    #[error("a handler is already installed on this queue")]
    HandlerAlreadyInstalled,

    /// The queue was cleared or dropped while a future was still pending.
    #[error("queue closed before this item was handled")]
    QueueClosed,
}

pub type Result<T> = std::result::Result<T, CoreError>;
