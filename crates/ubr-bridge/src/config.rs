//! Bridge configuration
//!
//! Loads and validates bridge settings from TOML files. Every field has a
//! default, so a partial file (or none at all) yields a usable bridge.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;
use ubr_types::EtherType;

/// Bridge-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bridge device name; also the master name recorded on enslaved devices
    #[serde(default = "default_name")]
    pub name: String,

    /// Idle time after which a dynamic FDB entry is aged out
    #[serde(default = "default_ageing_time")]
    pub ageing_time_secs: u64,

    /// Tag protocol identifier (0x8100 or 0x88a8)
    #[serde(default = "default_vlan_protocol")]
    pub vlan_protocol: EtherType,

    /// Flush dynamic FDB entries learned on a port when it is deleted
    #[serde(default = "default_flush_on_port_del")]
    pub flush_on_port_del: bool,

    /// Learning state of newly created VLANs
    #[serde(default = "default_learning")]
    pub default_learning: bool,
}

fn default_name() -> String {
    "ubr0".to_string()
}

fn default_ageing_time() -> u64 {
    300
}

fn default_vlan_protocol() -> EtherType {
    EtherType::VLAN_8021Q
}

fn default_flush_on_port_del() -> bool {
    true
}

fn default_learning() -> bool {
    true
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            ageing_time_secs: default_ageing_time(),
            vlan_protocol: default_vlan_protocol(),
            flush_on_port_del: default_flush_on_port_del(),
            default_learning: default_learning(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = toml::from_str(&content).map_err(|e| {
                    BridgeError::Config(format!(
                        "Failed to parse config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(BridgeError::Io(e)),
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BridgeError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Ageing timeout as Duration
    pub fn ageing_time(&self) -> Duration {
        Duration::from_secs(self.ageing_time_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BridgeError::Config("name must not be empty".to_string()));
        }
        if self.ageing_time_secs == 0 {
            return Err(BridgeError::Config(
                "ageing_time_secs must be > 0".to_string(),
            ));
        }
        if !self.vlan_protocol.is_vlan() {
            return Err(BridgeError::Config(format!(
                "vlan_protocol {} is not 802.1Q or 802.1ad",
                self.vlan_protocol
            )));
        }
        Ok(())
    }
}
