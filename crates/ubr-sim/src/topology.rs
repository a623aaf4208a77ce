//! Simulator configuration file.
//!
//! ```toml
//! [bridge]
//! name = "ubr0"
//! ageing_time_secs = 30
//!
//! [topology]
//! ports = ["eth1", "eth2", "eth3", "eth4"]
//!
//! [[topology.vlans]]
//! vid = 10
//! untagged = ["eth1", "eth2"]
//! tagged = ["eth4"]
//!
//! [topology.pvids]
//! eth1 = 10
//! eth2 = 10
//!
//! [traffic]
//! frames_per_port = 100000
//! stations_per_port = 16
//! churn_port = "eth3"
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;
use ubr_bridge::{BridgeConfig, ControlRequest, VlanId};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub topology: Topology,

    #[serde(default)]
    pub traffic: TrafficConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    /// Device names, enslaved in this order
    #[serde(default = "default_ports")]
    pub ports: Vec<String>,

    #[serde(default)]
    pub vlans: Vec<VlanSpec>,

    /// Port VLAN ID per device; unlisted ports keep VLAN 0
    #[serde(default)]
    pub pvids: BTreeMap<String, VlanId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlanSpec {
    pub vid: VlanId,

    #[serde(default)]
    pub untagged: Vec<String>,

    #[serde(default)]
    pub tagged: Vec<String>,

    /// Detach the listed ports from VLAN 0
    #[serde(default)]
    pub exclusive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficConfig {
    #[serde(default = "default_frames_per_port")]
    pub frames_per_port: u64,

    /// Distinct source stations behind each port
    #[serde(default = "default_stations_per_port")]
    pub stations_per_port: u16,

    /// Share of frames sent to broadcast, in percent
    #[serde(default = "default_broadcast_percent")]
    pub broadcast_percent: u8,

    /// Port repeatedly deleted and re-added while traffic runs
    #[serde(default)]
    pub churn_port: Option<String>,

    #[serde(default = "default_churn_interval_ms")]
    pub churn_interval_ms: u64,

    #[serde(default)]
    pub seed: u64,
}

fn default_ports() -> Vec<String> {
    (1..=4).map(|i| format!("eth{i}")).collect()
}

fn default_frames_per_port() -> u64 {
    100_000
}

fn default_stations_per_port() -> u16 {
    16
}

fn default_broadcast_percent() -> u8 {
    5
}

fn default_churn_interval_ms() -> u64 {
    50
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            ports: default_ports(),
            vlans: Vec::new(),
            pvids: BTreeMap::new(),
        }
    }
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            frames_per_port: default_frames_per_port(),
            stations_per_port: default_stations_per_port(),
            broadcast_percent: default_broadcast_percent(),
            churn_port: None,
            churn_interval_ms: default_churn_interval_ms(),
            seed: 0,
        }
    }
}

impl SimConfig {
    /// Loads `path`, or the defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.bridge.validate()?;
        let known = |name: &String| self.topology.ports.contains(name);

        for vlan in &self.topology.vlans {
            for name in vlan.untagged.iter().chain(&vlan.tagged) {
                if !known(name) {
                    bail!("vlan {}: unknown port {name}", vlan.vid);
                }
            }
        }
        for (name, vid) in &self.topology.pvids {
            if !known(name) {
                bail!("pvid for unknown port {name}");
            }
            if !vid.is_none() && !self.topology.vlans.iter().any(|v| v.vid == *vid) {
                bail!("pvid {vid} of {name} names an unconfigured vlan");
            }
        }
        if let Some(name) = &self.traffic.churn_port {
            if !known(name) {
                bail!("churn port {name} is not in the topology");
            }
        }
        if self.traffic.stations_per_port == 0 {
            bail!("stations_per_port must be > 0");
        }
        if self.traffic.broadcast_percent > 100 {
            bail!("broadcast_percent must be <= 100");
        }
        Ok(())
    }
}

impl Topology {
    /// Control requests that build the topology on an empty bridge.
    pub fn requests(&self) -> Vec<ControlRequest> {
        let mut requests: Vec<ControlRequest> = self
            .ports
            .iter()
            .map(|device| ControlRequest::PortAdd {
                device: device.clone(),
                defaults: Default::default(),
            })
            .collect();

        for vlan in &self.vlans {
            requests.push(ControlRequest::VlanAdd { vid: vlan.vid });
        }
        for port in &self.ports {
            requests.extend(self.port_requests(port));
        }
        requests
    }

    /// VLAN membership and PVID requests for one port, as needed again
    /// after the port is re-added.
    ///
    /// A port in any exclusive VLAN leaves VLAN 0 once, after its attaches.
    pub fn port_requests(&self, port: &str) -> Vec<ControlRequest> {
        let mut requests = Vec::new();
        let mut leave_default = false;
        for vlan in &self.vlans {
            let tagged = if vlan.tagged.iter().any(|p| p == port) {
                true
            } else if vlan.untagged.iter().any(|p| p == port) {
                false
            } else {
                continue;
            };
            requests.push(ControlRequest::VlanAttach {
                vid: vlan.vid,
                port: port.to_string(),
                tagged,
            });
            leave_default |= vlan.exclusive;
        }
        if leave_default {
            requests.push(ControlRequest::VlanDetach {
                vid: VlanId::NONE,
                port: port.to_string(),
            });
        }
        if let Some(vid) = self.pvids.get(port) {
            requests.push(ControlRequest::PortSetPvid {
                port: port.to_string(),
                vid: *vid,
            });
        }
        requests
    }

    /// VLANs `port` sends tagged traffic on.
    pub fn tagged_vlans(&self, port: &str) -> Vec<VlanId> {
        self.vlans
            .iter()
            .filter(|v| v.tagged.iter().any(|p| p == port))
            .map(|v| v.vid)
            .collect()
    }
}
