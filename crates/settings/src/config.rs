//! Configuration types

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{default_settings_path, Result, SettingsError};

/// Main settings structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Relay (SOCKS5 listener) settings
    #[serde(default)]
    pub relay: RelaySettings,

    /// Peer-connection settings
    #[serde(default)]
    pub peer: PeerSettings,

    /// Custom settings file path (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay: RelaySettings::default(),
            peer: PeerSettings::default(),
            config_path: None,
        }
    }
}

impl Settings {
    /// Load settings from the default path, or create defaults
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    /// Load settings from a specific path, or create defaults
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let mut settings: Settings =
                serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
            settings.config_path = Some(path.clone());
            info!("Loaded settings from {:?}", path);
            Ok(settings)
        } else {
            let mut settings = Self::default();
            settings.config_path = Some(path.clone());
            Ok(settings)
        }
    }

    /// Save settings to the configured path
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }
}

/// The SOCKS5 listener and connection-admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Address the SOCKS5 listener binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Port the SOCKS5 listener binds to. `0` resolves to a kernel-assigned
    /// ephemeral port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Hard cap on concurrently accepted connections. `None` uses
    /// `relaycraft_tcp::DEFAULT_MAX_CONNECTIONS`.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    1080
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            max_connections: None,
        }
    }
}

/// How this side of the peer connection finds its counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PeerMode {
    /// Dial a known multiaddr.
    #[default]
    Dial,
    /// Listen for an inbound connection.
    Listen,
}

/// Peer-connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSettings {
    /// Whether to dial or listen for the counterpart.
    #[serde(default)]
    pub mode: PeerMode,

    /// The multiaddr to dial, or the one to listen on, depending on `mode`.
    #[serde(default = "default_peer_multiaddr")]
    pub multiaddr: String,

    /// Whether to request the obfuscated transport upgrade. Plumbed through
    /// to `Libp2pPeerConnection`; the obfuscation layer itself is out of
    /// scope here.
    #[serde(default)]
    pub obfuscate: bool,
}

fn default_peer_multiaddr() -> String {
    "/ip4/0.0.0.0/tcp/0".to_string()
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            mode: PeerMode::default(),
            multiaddr: default_peer_multiaddr(),
            obfuscate: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.relay.listen_address, "127.0.0.1");
        assert_eq!(settings.relay.listen_port, 1080);
        assert!(settings.relay.max_connections.is_none());
    }

    #[test]
    fn test_peer_settings_default() {
        let peer = PeerSettings::default();
        assert_eq!(peer.mode, PeerMode::Dial);
        assert!(!peer.obfuscate);
    }

    #[test]
    fn test_settings_round_trip() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let parsed: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.relay.listen_port, settings.relay.listen_port);
    }

    #[test]
    fn test_settings_deserializes_partial_json() {
        let partial = r#"{"relay": {"listen_port": 9050}}"#;
        let settings: Settings = serde_json::from_str(partial).unwrap();
        assert_eq!(settings.relay.listen_port, 9050);
        assert_eq!(settings.relay.listen_address, "127.0.0.1");
        assert_eq!(settings.peer.mode, PeerMode::Dial);
    }
}
