//! Configuration system for Meridian.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MERIDIAN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meridian/config.toml
//!   3. ~/.config/meridian/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::DEFAULT_PORT;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub mirror: MirrorConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the Ed25519 private key. Generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the daemon accepts peer connections on.
    pub listen_addr: String,
    /// Route every outbound dial through a local SOCKS5 proxy.
    pub socks: bool,
    /// Port of the SOCKS5 proxy on 127.0.0.1.
    pub socks_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Capacity of the per-mirror progress channel.
    pub progress_buffer: usize,
    /// Peers to mirror on startup.
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Number of generated records to serve. 0 = empty catalog.
    pub seed_records: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("identity"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            socks: false,
            socks_port: 9050,
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            progress_buffer: 16,
            peers: Vec::new(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self { seed_records: 0 }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("meridian")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeridianConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::parse(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeridianConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MERIDIAN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeridianConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MERIDIAN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MERIDIAN_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_NETWORK__SOCKS") {
            self.network.socks = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MERIDIAN_NETWORK__SOCKS_PORT") {
            if let Ok(p) = v.parse() {
                self.network.socks_port = p;
            }
        }
        if let Ok(v) = std::env::var("MERIDIAN_CATALOG__SEED_RECORDS") {
            if let Ok(n) = v.parse() {
                self.catalog.seed_records = n;
            }
        }
    }

    /// SOCKS proxy port if proxy mode is on.
    pub fn socks_port(&self) -> Option<u16> {
        self.network.socks.then_some(self.network.socks_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = MeridianConfig::default();
        assert_eq!(config.network.listen_addr, "0.0.0.0:5050");
        assert!(!config.network.socks);
        assert_eq!(config.network.socks_port, 9050);
        assert_eq!(config.mirror.progress_buffer, 16);
        assert!(config.mirror.peers.is_empty());
        assert_eq!(config.socks_port(), None);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = MeridianConfig::parse(
            r#"
            [network]
            socks = true
            socks_port = 9150

            [mirror]
            peers = ["10.0.0.2:5050"]
            "#,
        )
        .unwrap();
        assert_eq!(config.socks_port(), Some(9150));
        assert_eq!(config.network.listen_addr, "0.0.0.0:5050");
        assert_eq!(config.mirror.peers, vec!["10.0.0.2:5050".to_string()]);
        assert_eq!(config.mirror.progress_buffer, 16);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(MeridianConfig::parse("[network\nsocks = ").is_err());
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("meridian-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("MERIDIAN_CONFIG", config_path.to_str().unwrap());
        }

        let path =
            MeridianConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = MeridianConfig::load().expect("load should succeed");
        assert_eq!(config.mirror.progress_buffer, 16);

        unsafe {
            std::env::remove_var("MERIDIAN_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
