//! relaycraft-tcp
//!
//! `TcpConnection` and `TcpServer`: the TCP-facing half of the relay's core,
//! built over `tokio::net`.

mod connection;
mod error;
mod server;

pub use connection::{TcpConnection, WriteInfo};
pub use error::{Result, TcpError};
pub use server::{TcpServer, DEFAULT_MAX_CONNECTIONS};
