//! relaycraft-session
//!
//! `Session` — pairs one accepted SOCKS5 TCP connection to one labeled data
//! channel on a `PeerConnection`: SOCKS5 NOAUTH/CONNECT handshake, request
//! relayed to the peer as JSON, endpoint reply relayed back as a SOCKS5
//! success reply, then bidirectional binary forwarding.

mod error;
mod session;
mod socks5;

pub use error::SessionError;
pub use session::{ByteCounters, Session};
