//! relaycraft-peer
//!
//! The `PeerConnection` seam — a peer-to-peer datagram transport reachable
//! only through `open_data_channel` / `send` / `data_from_peer` / signal
//! streams — plus two implementations: a production adapter over `libp2p`,
//! and an in-process loopback test double.

mod connection;
mod error;
mod frame;
mod libp2p_adapter;
mod loopback;

pub use connection::{PeerConnection, PeerFrame, SignallingMessage};
pub use error::{PeerError, Result};
pub use frame::{read_frame, read_label, write_frame, write_label, DataFrame};
pub use libp2p_adapter::{Libp2pConfig, Libp2pPeerConnection, RemotePeer};
pub use loopback::LoopbackPeerConnection;
