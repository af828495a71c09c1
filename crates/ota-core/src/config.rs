//! Agent configuration, loaded from TOML.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::image::HEADER_MIN_BYTES;
use crate::slot::SlotLayout;
use crate::transport::{CompletionPolicy, TransportError, TransportOptions};

/// Access point the device brings up for its peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
    pub max_peers: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssid: "ESP32_OTA_AP".to_string(),
            password: String::new(),
            channel: 1,
            max_peers: 1,
        }
    }
}

/// Configuration of the update agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Image URL. `file://` is accepted for host runs.
    pub update_url: String,
    /// PEM file holding the certificate the server must present.
    pub server_cert: Option<PathBuf>,
    /// Per-read transport timeout in milliseconds.
    pub timeout_ms: u64,
    /// Reuse connections.
    pub keep_alive: bool,
    /// Transport buffer capacity.
    pub chunk_size: usize,
    /// End-of-stream rule.
    pub completion: CompletionPolicy,
    /// Reject images whose version was already rolled back.
    pub enforce_known_bad_check: bool,
    /// Startup checkpoint poll budget.
    pub peer_max_polls: u32,
    pub peer_poll_interval_ms: u64,
    /// Wait before the fallback restart after a failed attempt.
    pub fault_grace_ms: u64,
    pub network: NetworkConfig,
    pub layout: SlotLayout,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            update_url: "https://192.168.4.2:8070/firmware.bin".to_string(),
            server_cert: None,
            timeout_ms: 5000,
            keep_alive: true,
            chunk_size: 1024,
            completion: CompletionPolicy::default(),
            enforce_known_bad_check: true,
            peer_max_polls: 30,
            peer_poll_interval_ms: 1000,
            fault_grace_ms: 5000,
            network: NetworkConfig::default(),
            layout: SlotLayout::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size < HEADER_MIN_BYTES {
            bail!(
                "chunk_size {} is smaller than the image header ({} bytes)",
                self.chunk_size,
                HEADER_MIN_BYTES
            );
        }
        if self.peer_max_polls == 0 {
            bail!("peer_max_polls must be at least 1");
        }
        self.layout.validate()?;
        Ok(())
    }

    pub fn skip_version_check(&self) -> bool {
        !self.enforce_known_bad_check
    }

    pub fn peer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.peer_poll_interval_ms)
    }

    pub fn fault_grace(&self) -> Duration {
        Duration::from_millis(self.fault_grace_ms)
    }

    /// Transport options, with the server certificate read from disk.
    pub fn transport_options(&self) -> Result<TransportOptions, TransportError> {
        let server_cert_pem = match &self.server_cert {
            Some(path) => Some(std::fs::read(path).map_err(|e| {
                TransportError::Credential(format!("{}: {}", path.display(), e))
            })?),
            None => None,
        };
        Ok(TransportOptions {
            server_cert_pem,
            timeout: Duration::from_millis(self.timeout_ms),
            keep_alive: self.keep_alive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.peer_max_polls, 30);
        assert_eq!(config.completion, CompletionPolicy::ContentComplete);
        assert!(!config.skip_version_check());
    }

    #[test]
    fn test_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");

        let config = AgentConfig {
            update_url: "file:///tmp/fw.bin".into(),
            completion: CompletionPolicy::ShortChunk,
            enforce_known_bad_check: false,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(AgentConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AgentConfig = toml::from_str("chunk_size = 2048\n").unwrap();
        assert_eq!(config.chunk_size, 2048);
        assert_eq!(config.network.ssid, "ESP32_OTA_AP");
    }

    #[test]
    fn test_validate_rejects_small_chunks() {
        let config = AgentConfig {
            chunk_size: 256,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_certificate() {
        let config = AgentConfig {
            server_cert: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        assert!(matches!(
            config.transport_options(),
            Err(TransportError::Credential(_))
        ));
    }
}
