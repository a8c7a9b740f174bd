//! Configuration loading from `~/.tether/config.toml` with defaults.

use std::path::{Path, PathBuf};
use tether_types::config::PeerConfig;
use tracing::{info, warn};

/// Load peer configuration from a TOML file, with defaults.
///
/// A missing, unreadable or malformed file yields [`PeerConfig::default`].
pub fn load_config(path: Option<&Path>) -> PeerConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return PeerConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<PeerConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                PeerConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            PeerConfig::default()
        }
    }
}

/// The Tether home directory (`~/.tether`).
pub fn tether_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".tether")
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    tether_home().join("config.toml")
}
