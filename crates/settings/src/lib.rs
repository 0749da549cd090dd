//! relaycraft-settings
//!
//! Persisted configuration for the `relaycraft` binary: where the SOCKS5
//! listener binds, how many connections it admits, and how this side of the
//! peer connection finds its counterpart. JSON on disk, defaults for every
//! field so a partial or missing file still loads.
//!
//! ## Usage
//!
//! ```no_run
//! use relaycraft_settings::Settings;
//!
//! let settings = Settings::load_or_default()?;
//! settings.save()?;
//! # Ok::<(), relaycraft_settings::SettingsError>(())
//! ```

mod config;

pub use config::{PeerMode, PeerSettings, RelaySettings, Settings};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Returns the directory relaycraft stores its configuration under, honoring
/// `XDG_CONFIG_HOME` and falling back to `$HOME/.config`.
pub fn default_config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("relaycraft");
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(".config").join("relaycraft");
        }
    }

    PathBuf::from(".relaycraft")
}

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_dir_is_non_empty() {
        assert!(!default_config_dir().as_os_str().is_empty());
    }

    #[test]
    fn default_settings_path_ends_in_settings_json() {
        assert_eq!(
            default_settings_path().file_name().unwrap(),
            "settings.json"
        );
    }
}
