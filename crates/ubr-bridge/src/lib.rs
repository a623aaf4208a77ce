//! UBR bridge data plane
//!
//! A VLAN-aware multiport Ethernet bridge: port table, VLAN database,
//! forwarding database with learning and ageing, and the per-frame
//! forwarding pipeline. Frames may be received on any number of threads
//! while the control plane adds and removes ports and VLANs.
//!
//! Devices and the local network stack are reached through the traits in
//! [`device`]; in-memory implementations are provided for tests and the
//! simulator.

pub mod ageing;
pub mod bridge;
pub mod config;
pub mod control;
pub mod device;
pub mod epoch;
pub mod error;
pub mod fdb;
pub mod forward;
pub mod frame;
pub mod port;
pub mod portvec;
pub mod stats;
pub mod vlan;

pub use ageing::Ager;
pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use control::{ControlRequest, ControlResponse};
pub use device::{
    DeviceError, DeviceKind, DeviceRegistry, LocalStack, MemoryDevice, MemoryRegistry,
    MemoryStack, NetDevice,
};
pub use epoch::{Epoch, EpochGuard};
pub use error::*;
pub use fdb::{
    AddressKind, Fdb, FdbAddress, FdbEntry, FdbKey, FdbOrigin, FdbRecord, FlushFilter,
    LearnOutcome,
};
pub use forward::{ControlTrap, DropReason, Verdict};
pub use frame::Frame;
pub use port::{IngressDefaults, PortHandle, PortInfo, LOCAL_PORT};
pub use portvec::{AtomicPortVector, PortIndex, PortVector, MAX_PORTS};
pub use stats::{BridgeCounters, CountersSnapshot};
pub use vlan::{FloodClass, VlanInfo};

pub use ubr_types::{EtherType, MacAddress, VlanId, VlanTag};
