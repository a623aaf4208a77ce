//! Typed control channel.
//!
//! Requests name ports by device name (the bridge's own name refers to the
//! local port) so they can cross a process boundary as JSON or TOML. No wire
//! framing is defined here.

use crate::bridge::Bridge;
use crate::error::{BridgeError, Result};
use crate::fdb::{FdbKey, FdbOrigin, FdbRecord, FlushFilter};
use crate::port::{IngressDefaults, PortHandle, PortInfo};
use crate::portvec::PortVector;
use crate::stats::CountersSnapshot;
use crate::vlan::{FloodClass, VlanInfo};
use serde::{Deserialize, Serialize};
use tracing::debug;
use ubr_types::VlanId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    PortAdd {
        device: String,
        #[serde(default)]
        defaults: IngressDefaults,
    },
    PortDel {
        device: String,
    },
    PortSetPvid {
        port: String,
        vid: VlanId,
    },
    PortSetIngress {
        port: String,
        defaults: IngressDefaults,
    },
    PortList,
    VlanAdd {
        vid: VlanId,
    },
    VlanDel {
        vid: VlanId,
    },
    VlanAttach {
        vid: VlanId,
        port: String,
        #[serde(default)]
        tagged: bool,
    },
    VlanDetach {
        vid: VlanId,
        port: String,
    },
    VlanSetLearning {
        vid: VlanId,
        enabled: bool,
    },
    VlanSetFlood {
        vid: VlanId,
        port: String,
        class: FloodClass,
        enabled: bool,
    },
    VlanSetRouter {
        vid: VlanId,
        port: String,
        enabled: bool,
    },
    VlanList,
    FdbFlush {
        #[serde(default)]
        port: Option<String>,
        #[serde(default)]
        vid: Option<VlanId>,
        #[serde(default)]
        origin: Option<FdbOrigin>,
        #[serde(default)]
        aged_only: bool,
    },
    FdbAdd {
        key: FdbKey,
        ports: Vec<String>,
        #[serde(default = "default_static_origin")]
        origin: FdbOrigin,
    },
    FdbDel {
        key: FdbKey,
    },
    FdbDump,
    Counters,
}

fn default_static_origin() -> FdbOrigin {
    FdbOrigin::User
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    PortAdded { port: PortHandle },
    Ports { ports: Vec<PortInfo> },
    Vlans { vlans: Vec<VlanInfo> },
    Flushed { count: usize },
    Fdb { entries: Vec<FdbRecord> },
    Counters { counters: CountersSnapshot },
}

impl Bridge {
    /// Executes one control request.
    pub fn handle(&self, request: ControlRequest) -> Result<ControlResponse> {
        debug!(?request, "control request");
        match request {
            ControlRequest::PortAdd { device, defaults } => {
                let dev = self
                    .registry()
                    .lookup(&device)
                    .ok_or_else(|| BridgeError::NotFound(format!("device {device}")))?;
                let port = self.port_add(dev, defaults)?;
                Ok(ControlResponse::PortAdded { port })
            }
            ControlRequest::PortDel { device } => {
                let index = self.port_index(&device)?;
                self.port_del(index)?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::PortSetPvid { port, vid } => {
                self.port_set_pvid(self.port_index(&port)?, vid)?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::PortSetIngress { port, defaults } => {
                self.port_set_ingress(self.port_index(&port)?, defaults)?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::PortList => Ok(ControlResponse::Ports {
                ports: self.ports(),
            }),
            ControlRequest::VlanAdd { vid } => {
                self.vlan_add(vid)?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::VlanDel { vid } => {
                self.vlan_del(vid)?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::VlanAttach { vid, port, tagged } => {
                self.vlan_attach(vid, self.port_index(&port)?, tagged)?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::VlanDetach { vid, port } => {
                self.vlan_detach(vid, self.port_index(&port)?)?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::VlanSetLearning { vid, enabled } => {
                self.vlan_set_learning(vid, enabled)?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::VlanSetFlood {
                vid,
                port,
                class,
                enabled,
            } => {
                self.vlan_set_flood(vid, class, self.port_index(&port)?, enabled)?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::VlanSetRouter { vid, port, enabled } => {
                self.vlan_set_router(vid, self.port_index(&port)?, enabled)?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::VlanList => Ok(ControlResponse::Vlans {
                vlans: self.vlans(),
            }),
            ControlRequest::FdbFlush {
                port,
                vid,
                origin,
                aged_only,
            } => {
                let port = port.map(|name| self.port_index(&name)).transpose()?;
                let filter = FlushFilter {
                    port,
                    vid,
                    origin,
                    aged_only,
                };
                Ok(ControlResponse::Flushed {
                    count: self.fdb_flush(&filter),
                })
            }
            ControlRequest::FdbAdd { key, ports, origin } => {
                let ports = ports
                    .iter()
                    .map(|name| self.port_index(name))
                    .collect::<Result<PortVector>>()?;
                self.fdb_add(key, ports, origin)?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::FdbDel { key } => {
                self.fdb_del(&key)?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::FdbDump => Ok(ControlResponse::Fdb {
                entries: self.fdb_entries(),
            }),
            ControlRequest::Counters => Ok(ControlResponse::Counters {
                counters: self.counters(),
            }),
        }
    }
}
