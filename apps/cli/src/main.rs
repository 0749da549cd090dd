//! relaycraft CLI
//!
//! Starts a relay: a SOCKS5 listener on one side, a libp2p peer connection
//! on the other.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libp2p::Multiaddr;
use tracing::info;

use relaycraft_core::Endpoint;
use relaycraft_logging::LogLevel;
use relaycraft_peer::{Libp2pConfig, Libp2pPeerConnection, RemotePeer};
use relaycraft_relay::Relay;
use relaycraft_settings::{PeerMode, Settings};

/// relaycraft - SOCKS5-to-peer-connection relay
#[derive(Parser)]
#[command(name = "relaycraft")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay and run until interrupted
    Serve {
        /// Override the SOCKS5 listen address
        #[arg(long)]
        listen_address: Option<String>,

        /// Override the SOCKS5 listen port
        #[arg(long)]
        listen_port: Option<u16>,
    },

    /// Print the currently configured settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { LogLevel::Debug } else { LogLevel::Info };
    let _ = relaycraft_logging::try_init(level);

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path).map_err(|e| anyhow::anyhow!("{}", e))?,
        None => Settings::load_or_default().map_err(|e| anyhow::anyhow!("{}", e))?,
    };

    match cli.command {
        Commands::Serve {
            listen_address,
            listen_port,
        } => serve(settings, listen_address, listen_port).await,
        Commands::Config => {
            print_config(&settings);
            Ok(())
        }
    }
}

fn print_config(settings: &Settings) {
    println!(
        "listen: {}:{}",
        settings.relay.listen_address, settings.relay.listen_port
    );
    println!("max_connections: {:?}", settings.relay.max_connections);
    println!("peer.mode: {:?}", settings.peer.mode);
    println!("peer.multiaddr: {}", settings.peer.multiaddr);
    println!("peer.obfuscate: {}", settings.peer.obfuscate);
}

async fn serve(settings: Settings, listen_address: Option<String>, listen_port: Option<u16>) -> Result<()> {
    let address = listen_address.unwrap_or(settings.relay.listen_address);
    let port = listen_port.unwrap_or(settings.relay.listen_port);
    let endpoint = Endpoint::new(address, port);

    let multiaddr: Multiaddr = settings
        .peer
        .multiaddr
        .parse()
        .context("invalid peer multiaddr in settings")?;

    let remote = match settings.peer.mode {
        PeerMode::Dial => RemotePeer::Dial(multiaddr),
        PeerMode::Listen => RemotePeer::Listen(multiaddr),
    };

    let keypair = libp2p::identity::Keypair::generate_ed25519();
    let peer_config = Libp2pConfig {
        keypair,
        remote,
        obfuscate: settings.peer.obfuscate,
    };
    let peer = Arc::new(Libp2pPeerConnection::new(peer_config));

    let relay = Relay::bind(endpoint, settings.relay.max_connections, peer);
    relay.start().await.map_err(|e| anyhow::anyhow!("{}", e))?;

    let bound = relay
        .once_ready()
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    info!("SOCKS5 listener bound on {}", bound);

    tokio::select! {
        _ = relay.once_stopped() => {
            info!("relay stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            relay.stop().await;
        }
    }

    info!(
        "sessions handled, bytes to peer: {}, bytes from peer: {}",
        relay.bytes_sent_to_peer(),
        relay.bytes_received_from_peer()
    );

    Ok(())
}
