//! Port table.
//!
//! Ports live in a fixed arena of [`MAX_PORTS`] slots. The slot array is
//! published as an immutable snapshot and replaced wholesale on add/delete;
//! per-port settings that change at runtime (PVID, ingress defaults) are
//! atomics inside the record. `Busy` tracks allocated indices, `Active` the
//! indices frames may be forwarded to. `Active ⊆ Busy`.
//!
//! A deleted index stays Busy until its record has been reclaimed, so a new
//! port never shares an index with a record an in-flight frame still holds.

use crate::device::{DeviceKind, NetDevice};
use crate::error::{BridgeError, Result};
use crate::portvec::{AtomicPortVector, PortIndex, PortVector, MAX_PORTS};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use tracing::debug;
use ubr_types::{MacAddress, VlanId};

/// Index of the bridge's own upward-facing port.
pub const LOCAL_PORT: PortIndex = 0;

/// Per-port ingress behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressDefaults {
    /// Drop frames whose VLAN does not list this port as a member.
    pub vlan_filtering: bool,
    /// Learn source addresses seen on this port.
    pub learning: bool,
}

impl Default for IngressDefaults {
    fn default() -> Self {
        Self {
            vlan_filtering: true,
            learning: true,
        }
    }
}

/// Stable reference to a port: index plus the generation it was added with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortHandle {
    pub index: PortIndex,
    pub generation: u64,
}

impl fmt::Display for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Where frames sent out of a port go.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Up into the local network stack.
    Local,
    Device(Arc<dyn NetDevice>),
}

#[derive(Debug)]
pub struct Port {
    index: PortIndex,
    generation: u64,
    name: String,
    endpoint: Endpoint,
    pvid: AtomicU16,
    vlan_filtering: AtomicBool,
    learning: AtomicBool,
    egress: PortVector,
}

impl Port {
    fn new(index: PortIndex, generation: u64, name: String, endpoint: Endpoint, defaults: IngressDefaults) -> Self {
        let mut egress = PortVector::full();
        egress.clear(index);
        Self {
            index,
            generation,
            name,
            endpoint,
            pvid: AtomicU16::new(VlanId::NONE.as_u16()),
            vlan_filtering: AtomicBool::new(defaults.vlan_filtering),
            learning: AtomicBool::new(defaults.learning),
            egress,
        }
    }

    pub fn index(&self) -> PortIndex {
        self.index
    }

    pub fn handle(&self) -> PortHandle {
        PortHandle {
            index: self.index,
            generation: self.generation,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn device(&self) -> Option<&Arc<dyn NetDevice>> {
        match &self.endpoint {
            Endpoint::Device(dev) => Some(dev),
            Endpoint::Local => None,
        }
    }

    /// Default egress set: every port but this one.
    pub fn egress(&self) -> &PortVector {
        &self.egress
    }

    pub fn pvid(&self) -> VlanId {
        VlanId::new(self.pvid.load(Ordering::Acquire)).unwrap_or(VlanId::NONE)
    }

    pub(crate) fn set_pvid(&self, vid: VlanId) {
        self.pvid.store(vid.as_u16(), Ordering::Release);
    }

    pub fn ingress_defaults(&self) -> IngressDefaults {
        IngressDefaults {
            vlan_filtering: self.vlan_filtering.load(Ordering::Acquire),
            learning: self.learning.load(Ordering::Acquire),
        }
    }

    pub(crate) fn set_ingress_defaults(&self, defaults: IngressDefaults) {
        self.vlan_filtering
            .store(defaults.vlan_filtering, Ordering::Release);
        self.learning.store(defaults.learning, Ordering::Release);
    }

    pub fn info(&self) -> PortInfo {
        PortInfo {
            index: self.index,
            generation: self.generation,
            name: self.name.clone(),
            pvid: self.pvid(),
            ingress: self.ingress_defaults(),
        }
    }
}

/// Serializable summary of a port for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub index: PortIndex,
    pub generation: u64,
    pub name: String,
    pub pvid: VlanId,
    pub ingress: IngressDefaults,
}

pub(crate) type Slots = Vec<Option<Arc<Port>>>;

/// Admission checks applied before a device may become a port.
pub fn validate_device(device: &dyn NetDevice, bridge_name: &str) -> Result<()> {
    let name = device.name();
    if name == bridge_name {
        return Err(BridgeError::InvalidDevice(format!(
            "{name}: cannot add a bridge to itself"
        )));
    }
    match device.kind() {
        DeviceKind::Ethernet => {}
        kind => {
            return Err(BridgeError::InvalidDevice(format!(
                "{name}: {kind:?} devices cannot be bridged"
            )))
        }
    }
    let mac: MacAddress = device.mac_address();
    if !mac.is_valid_unicast() {
        return Err(BridgeError::InvalidDevice(format!(
            "{name}: address {mac} is not a valid unicast address"
        )));
    }
    if device.has_master() {
        return Err(BridgeError::Busy(format!("{name} already has a master")));
    }
    if !device.bridging_allowed() {
        return Err(BridgeError::Unsupported(format!(
            "{name} does not allow bridging"
        )));
    }
    Ok(())
}

pub struct PortTable {
    slots: RwLock<Arc<Slots>>,
    busy: Arc<AtomicPortVector>,
    active: AtomicPortVector,
    generations: Mutex<Vec<u64>>,
}

impl PortTable {
    /// Creates the table with the local port installed at index 0.
    pub fn new(bridge_name: &str) -> Self {
        let table = Self {
            slots: RwLock::new(Arc::new(vec![None; MAX_PORTS])),
            busy: Arc::new(AtomicPortVector::default()),
            active: AtomicPortVector::default(),
            generations: Mutex::new(vec![0; MAX_PORTS]),
        };
        table.install(
            LOCAL_PORT,
            bridge_name.to_string(),
            Endpoint::Local,
            IngressDefaults::default(),
        );
        table
    }

    pub(crate) fn snapshot(&self) -> Arc<Slots> {
        self.slots.read().clone()
    }

    fn publish(&self, slots: Slots) {
        *self.slots.write() = Arc::new(slots);
    }

    fn install(&self, index: PortIndex, name: String, endpoint: Endpoint, defaults: IngressDefaults) -> Arc<Port> {
        let generation = {
            let mut generations = self.generations.lock();
            generations[index] += 1;
            generations[index]
        };
        let port = Arc::new(Port::new(index, generation, name, endpoint, defaults));
        self.busy.set(index);
        let mut slots = (*self.snapshot()).clone();
        slots[index] = Some(port.clone());
        self.publish(slots);
        port
    }

    /// Validates `device`, allocates the lowest free index and publishes the
    /// record. The port is Busy but not yet Active; see [`PortTable::activate`].
    pub fn add(&self, device: Arc<dyn NetDevice>, defaults: IngressDefaults, bridge_name: &str) -> Result<Arc<Port>> {
        if self.find_by_name(device.name()).is_some() {
            return Err(BridgeError::AlreadyMember(device.name().to_string()));
        }
        validate_device(device.as_ref(), bridge_name)?;

        let index = self
            .busy
            .load()
            .first_zero()
            .ok_or(BridgeError::CapacityExceeded(MAX_PORTS))?;

        let port = self.install(index, device.name().to_string(), Endpoint::Device(device), defaults);
        debug!(port = %port.handle(), name = port.name(), "port allocated");
        Ok(port)
    }

    pub fn activate(&self, index: PortIndex) {
        self.active.set(index);
    }

    /// Unpublishes the port at `index` and returns its record.
    ///
    /// The index stays Busy; the caller clears it through
    /// [`PortTable::busy_handle`] once the record is reclaimed.
    pub fn remove(&self, index: PortIndex) -> Result<Arc<Port>> {
        if index == LOCAL_PORT {
            return Err(BridgeError::Unsupported(
                "the local port cannot be deleted".to_string(),
            ));
        }
        let snapshot = self.snapshot();
        let port = snapshot
            .get(index)
            .cloned()
            .flatten()
            .ok_or_else(|| BridgeError::NotFound(format!("port {index}")))?;

        self.active.clear(index);
        let mut slots = (*snapshot).clone();
        slots[index] = None;
        self.publish(slots);
        Ok(port)
    }

    /// Shared handle to the Busy vector for deferred index release.
    pub fn busy_handle(&self) -> Arc<AtomicPortVector> {
        self.busy.clone()
    }

    pub fn get(&self, index: PortIndex) -> Option<Arc<Port>> {
        self.snapshot().get(index).cloned().flatten()
    }

    /// Resolves a handle, rejecting handles from an earlier use of the index.
    pub fn resolve(&self, handle: PortHandle) -> Result<Arc<Port>> {
        match self.get(handle.index) {
            Some(port) if port.generation == handle.generation => Ok(port),
            _ => Err(BridgeError::NotFound(format!("port {handle}"))),
        }
    }

    pub fn find(&self, device: &dyn NetDevice) -> Result<PortIndex> {
        self.find_by_name(device.name())
            .map(|p| p.index)
            .ok_or_else(|| BridgeError::NotFound(device.name().to_string()))
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Port>> {
        self.snapshot()
            .iter()
            .flatten()
            .find(|p| p.index != LOCAL_PORT && p.name == name)
            .cloned()
    }

    pub fn active(&self) -> PortVector {
        self.active.load()
    }

    pub fn is_active(&self, index: PortIndex) -> bool {
        self.active.test(index)
    }

    pub fn busy(&self) -> PortVector {
        self.busy.load()
    }

    /// Ports in index order, local port included.
    pub fn list(&self) -> Vec<Arc<Port>> {
        self.snapshot().iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for PortTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortTable")
            .field("busy", &self.busy.load())
            .field("active", &self.active.load())
            .finish()
    }
}
