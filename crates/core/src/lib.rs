//! relaycraft-core
//!
//! Shared types and the `HandlerQueue` primitive used throughout the
//! relaycraft workspace: `Endpoint`, `ConnectionInfo`, `SocketCloseKind`,
//! `ConnectionState`, and the id generators minting connection ids and
//! data-channel labels.

mod error;
mod once;
mod queue;
mod types;

pub use error::{CoreError, Result};
pub use once::OnceSignal;
pub use queue::{HandlerQueue, NextHandlerFuture};
pub use types::{
    next_adopted_connection_id, next_channel_label, next_connection_id, ConnectionInfo,
    ConnectionState, Endpoint, IdGenerator, SocketCloseKind, CHANNEL_LABELS, CONNECTION_IDS,
    CONTROL_CHANNEL_LABEL,
};
