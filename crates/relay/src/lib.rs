//! relaycraft-relay
//!
//! `Relay` — the composition root: owns a `TcpServer` and a
//! `PeerConnection`, constructs a `Session` per accepted connection, routes
//! inbound peer data to the right session by channel label, aggregates byte
//! counters, and tears the whole thing down deterministically when either
//! leg fails.

mod error;
mod relay;

pub use error::RelayError;
pub use relay::Relay;
