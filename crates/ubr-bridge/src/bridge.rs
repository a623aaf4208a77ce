//! The bridge instance.
//!
//! Control operations serialize on one lock and never wait for readers;
//! anything a reader may still hold is handed to the epoch reclaimer.
//! [`Bridge::receive`] takes no lock beyond the snapshot pointer clones.

use crate::ageing::Ager;
use crate::config::BridgeConfig;
use crate::device::{DeviceRegistry, LocalStack, NetDevice};
use crate::epoch::Epoch;
use crate::error::{BridgeError, Result};
use crate::fdb::{Fdb, FdbKey, FdbOrigin, FdbRecord, FlushFilter};
use crate::forward::ControlTrap;
use crate::port::{IngressDefaults, Port, PortHandle, PortInfo, PortTable, LOCAL_PORT};
use crate::portvec::{PortIndex, PortVector};
use crate::stats::{BridgeCounters, CountersSnapshot};
use crate::vlan::{FloodClass, VlanDb, VlanInfo};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use ubr_types::{EtherType, VlanId};

pub struct Bridge {
    pub(crate) config: BridgeConfig,
    pub(crate) proto: EtherType,
    pub(crate) ports: PortTable,
    pub(crate) vlans: VlanDb,
    pub(crate) fdb: Arc<Fdb>,
    pub(crate) epoch: Arc<Epoch>,
    pub(crate) counters: Arc<BridgeCounters>,
    pub(crate) stack: Arc<dyn LocalStack>,
    registry: Arc<dyn DeviceRegistry>,
    trap: RwLock<Option<Arc<dyn ControlTrap>>>,
    control: Mutex<()>,
    ager: Mutex<Option<Ager>>,
}

impl Bridge {
    /// Creates a bridge with the local port installed as an untagged member
    /// of VLAN 0.
    pub fn new(config: BridgeConfig, stack: Arc<dyn LocalStack>, registry: Arc<dyn DeviceRegistry>) -> Result<Self> {
        config.validate()?;

        let epoch = Arc::new(Epoch::new());
        let counters = Arc::new(BridgeCounters::new());
        let fdb = Arc::new(Fdb::new(config.ageing_time(), epoch.clone(), counters.clone()));
        let ports = PortTable::new(&config.name);
        let vlans = VlanDb::new(config.default_learning);
        vlans.attach(VlanId::NONE, LOCAL_PORT, false)?;
        ports.activate(LOCAL_PORT);

        info!(name = %config.name, proto = %config.vlan_protocol, ageing = ?config.ageing_time(), "bridge created");
        Ok(Self {
            proto: config.vlan_protocol,
            config,
            ports,
            vlans,
            fdb,
            epoch,
            counters,
            stack,
            registry,
            trap: RwLock::new(None),
            control: Mutex::new(()),
            ager: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn vlan_protocol(&self) -> EtherType {
        self.proto
    }

    pub(crate) fn registry(&self) -> &dyn DeviceRegistry {
        self.registry.as_ref()
    }

    pub(crate) fn trap(&self) -> Option<Arc<dyn ControlTrap>> {
        self.trap.read().clone()
    }

    /// Installs or removes the control-plane trap.
    pub fn set_trap(&self, trap: Option<Arc<dyn ControlTrap>>) {
        let _lock = self.control.lock();
        *self.trap.write() = trap;
    }

    /// Handle of the local port. It is installed once and never replaced.
    pub fn local_port(&self) -> PortHandle {
        PortHandle {
            index: LOCAL_PORT,
            generation: 1,
        }
    }

    // Ports

    #[instrument(skip(self, device), fields(bridge = %self.config.name, device = device.name()))]
    pub fn port_add(&self, device: Arc<dyn NetDevice>, defaults: IngressDefaults) -> Result<PortHandle> {
        let _lock = self.control.lock();

        let port = self.ports.add(device.clone(), defaults, &self.config.name)?;
        let index = port.index();
        if let Err(e) = device.enslave(&self.config.name) {
            warn!(error = %e, "enslave failed, rolling back");
            let port = self.ports.remove(index)?;
            self.retire_port(port);
            return Err(BridgeError::Busy(e.to_string()));
        }
        self.vlans.attach(VlanId::NONE, index, false)?;
        self.ports.activate(index);

        info!(port = %port.handle(), "port added");
        Ok(port.handle())
    }

    /// Queues an unpublished port record and its index for release.
    fn retire_port(&self, port: Arc<Port>) {
        let index = port.index();
        let busy = self.ports.busy_handle();
        self.epoch.retire(move || {
            drop(port);
            busy.clear(index);
        });
        self.epoch.try_reclaim();
    }

    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub fn port_del(&self, index: PortIndex) -> Result<()> {
        let _lock = self.control.lock();

        let port = self.ports.remove(index)?;
        let vlans = self.vlans.detach_all(index);

        let mut flushed = 0;
        if self.config.flush_on_port_del {
            flushed += self.fdb.flush(&FlushFilter::port(index));
        } else {
            for origin in [FdbOrigin::External, FdbOrigin::User] {
                flushed += self.fdb.flush(&FlushFilter {
                    port: Some(index),
                    origin: Some(origin),
                    ..FlushFilter::default()
                });
            }
        }
        self.counters.add(|c| &c.flushed, flushed as u64);

        if let Some(device) = port.device() {
            device.release();
        }
        info!(port = %port.handle(), name = port.name(), ?vlans, flushed, "port deleted");
        self.retire_port(port);
        Ok(())
    }

    pub fn port_find(&self, device: &dyn NetDevice) -> Result<PortIndex> {
        self.ports.find(device)
    }

    /// Port index for a device name; the bridge name is the local port.
    pub fn port_index(&self, name: &str) -> Result<PortIndex> {
        if name == self.config.name {
            return Ok(LOCAL_PORT);
        }
        self.ports
            .find_by_name(name)
            .map(|p| p.index())
            .ok_or_else(|| BridgeError::NotFound(format!("port {name}")))
    }

    /// Current handle of the port at `index`.
    pub fn port_handle(&self, index: PortIndex) -> Result<PortHandle> {
        self.ports
            .get(index)
            .map(|p| p.handle())
            .ok_or_else(|| BridgeError::NotFound(format!("port {index}")))
    }

    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub fn port_set_pvid(&self, index: PortIndex, vid: VlanId) -> Result<()> {
        let _lock = self.control.lock();
        let port = self
            .ports
            .get(index)
            .ok_or_else(|| BridgeError::NotFound(format!("port {index}")))?;
        if self.vlans.find(vid).is_none() {
            return Err(BridgeError::NotFound(format!("vlan {vid}")));
        }
        port.set_pvid(vid);
        info!(port = index, %vid, "pvid set");
        Ok(())
    }

    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub fn port_set_ingress(&self, index: PortIndex, defaults: IngressDefaults) -> Result<()> {
        let _lock = self.control.lock();
        let port = self
            .ports
            .get(index)
            .ok_or_else(|| BridgeError::NotFound(format!("port {index}")))?;
        port.set_ingress_defaults(defaults);
        info!(port = index, ?defaults, "ingress defaults set");
        Ok(())
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        self.ports.list().iter().map(|p| p.info()).collect()
    }

    pub fn active_ports(&self) -> PortVector {
        self.ports.active()
    }

    fn require_port(&self, index: PortIndex) -> Result<()> {
        match self.ports.get(index) {
            Some(_) => Ok(()),
            None => Err(BridgeError::NotFound(format!("port {index}"))),
        }
    }

    // VLANs

    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub fn vlan_add(&self, vid: VlanId) -> Result<()> {
        let _lock = self.control.lock();
        self.vlans.create(vid, self.config.default_learning)?;
        info!(%vid, "vlan created");
        Ok(())
    }

    /// Deletes `vid`. Ports using it as PVID fall back to VLAN 0 and its FDB
    /// entries are flushed.
    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub fn vlan_del(&self, vid: VlanId) -> Result<()> {
        let _lock = self.control.lock();
        let vlan = self.vlans.delete(vid)?;

        for port in self.ports.list() {
            if port.pvid() == vid {
                port.set_pvid(VlanId::NONE);
                info!(port = port.index(), %vid, "pvid reset after vlan delete");
            }
        }
        let flushed = self.fdb.flush(&FlushFilter {
            vid: Some(vid),
            ..FlushFilter::default()
        });
        self.counters.add(|c| &c.flushed, flushed as u64);

        self.epoch.retire(move || drop(vlan));
        self.epoch.try_reclaim();
        info!(%vid, flushed, "vlan deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub fn vlan_attach(&self, vid: VlanId, index: PortIndex, tagged: bool) -> Result<()> {
        let _lock = self.control.lock();
        self.require_port(index)?;
        self.vlans.attach(vid, index, tagged)?;
        info!(%vid, port = index, tagged, "vlan member attached");
        Ok(())
    }

    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub fn vlan_detach(&self, vid: VlanId, index: PortIndex) -> Result<()> {
        let _lock = self.control.lock();
        self.require_port(index)?;
        self.vlans.detach(vid, index)?;
        info!(%vid, port = index, "vlan member detached");
        Ok(())
    }

    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub fn vlan_set_learning(&self, vid: VlanId, enabled: bool) -> Result<()> {
        let _lock = self.control.lock();
        self.vlans.set_learning(vid, enabled)?;
        info!(%vid, enabled, "vlan learning set");
        Ok(())
    }

    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub fn vlan_set_flood(&self, vid: VlanId, class: FloodClass, index: PortIndex, enabled: bool) -> Result<()> {
        let _lock = self.control.lock();
        self.require_port(index)?;
        self.vlans.set_flood(vid, class, index, enabled)?;
        info!(%vid, ?class, port = index, enabled, "vlan flood set");
        Ok(())
    }

    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub fn vlan_set_router(&self, vid: VlanId, index: PortIndex, enabled: bool) -> Result<()> {
        let _lock = self.control.lock();
        self.require_port(index)?;
        self.vlans.set_router(vid, index, enabled)?;
        info!(%vid, port = index, enabled, "vlan router port set");
        Ok(())
    }

    pub fn vlans(&self) -> Vec<VlanInfo> {
        self.vlans.list().iter().map(|v| v.info()).collect()
    }

    pub fn vlan(&self, vid: VlanId) -> Option<VlanInfo> {
        self.vlans.find(vid).map(|v| v.info())
    }

    // FDB

    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub fn fdb_flush(&self, filter: &FlushFilter) -> usize {
        let _lock = self.control.lock();
        let count = self.fdb.flush(filter);
        self.counters.add(|c| &c.flushed, count as u64);
        self.epoch.try_reclaim();
        info!(count, "fdb flushed");
        count
    }

    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub fn fdb_add(&self, key: FdbKey, ports: PortVector, origin: FdbOrigin) -> Result<()> {
        let _lock = self.control.lock();
        if self.vlans.find(key.vid).is_none() {
            return Err(BridgeError::NotFound(format!("vlan {}", key.vid)));
        }
        for index in ports.iter() {
            self.require_port(index)?;
        }
        self.fdb.add_static(key, ports, origin)?;
        self.epoch.try_reclaim();
        info!(%key, ?ports, "fdb entry added");
        Ok(())
    }

    #[instrument(skip(self), fields(bridge = %self.config.name))]
    pub fn fdb_del(&self, key: &FdbKey) -> Result<()> {
        let _lock = self.control.lock();
        self.fdb.remove(key)?;
        self.epoch.try_reclaim();
        info!(%key, "fdb entry removed");
        Ok(())
    }

    pub fn fdb_entries(&self) -> Vec<FdbRecord> {
        self.fdb.entries()
    }

    pub fn fdb(&self) -> &Fdb {
        &self.fdb
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    // Lifecycle

    /// Starts the ageing task on the current tokio runtime.
    pub fn start_ageing(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BridgeError::Unsupported(format!("no tokio runtime: {e}")))?;
        let mut ager = self.ager.lock();
        if ager.is_some() {
            return Err(BridgeError::AlreadyExists("ageing task".to_string()));
        }
        *ager = Some(Ager::spawn(&runtime, self.fdb.clone(), self.epoch.clone()));
        Ok(())
    }

    /// Runs releases that have become safe. Never waits.
    pub fn try_reclaim(&self) -> usize {
        self.epoch.try_reclaim()
    }

    /// Waits until every retired record has been released.
    pub fn quiesce(&self, timeout: Duration) -> bool {
        self.epoch.quiesce(timeout)
    }

    /// Stops ageing, removes every device port and drains the reclaimer.
    pub async fn shutdown(&self) {
        let ager = self.ager.lock().take();
        if let Some(ager) = ager {
            ager.shutdown().await;
        }

        let indices: Vec<PortIndex> = self
            .ports
            .list()
            .iter()
            .map(|p| p.index())
            .filter(|&i| i != LOCAL_PORT)
            .collect();
        for index in indices {
            if let Err(e) = self.port_del(index) {
                warn!(port = index, error = %e, "port delete during shutdown failed");
            }
        }

        if !self.epoch.quiesce(Duration::from_secs(5)) {
            warn!(pending = self.epoch.pending(), "reclaimer did not drain");
        }
        info!(name = %self.config.name, "bridge shut down");
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("name", &self.config.name)
            .field("ports", &self.ports)
            .field("vlans", &self.vlans)
            .field("fdb", &self.fdb)
            .field("epoch", &self.epoch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemoryDevice, MemoryRegistry, MemoryStack};
    use pretty_assertions::assert_eq;
    use ubr_types::MacAddress;

    fn bridge() -> Bridge {
        Bridge::new(
            BridgeConfig::default(),
            Arc::new(MemoryStack::new()),
            Arc::new(MemoryRegistry::new()),
        )
        .unwrap()
    }

    fn dev(name: &str, last: u8) -> Arc<MemoryDevice> {
        Arc::new(MemoryDevice::ethernet(name, MacAddress::new([0x02, 0, 0, 0, 1, last])))
    }

    fn vid(id: u16) -> VlanId {
        VlanId::new(id).unwrap()
    }

    #[test]
    fn test_new_installs_local_port() {
        let br = bridge();
        assert_eq!(br.ports().len(), 1);
        assert!(br.active_ports().test(LOCAL_PORT));
        assert!(br.vlan(VlanId::NONE).unwrap().members.test(LOCAL_PORT));
        assert!(matches!(br.port_del(LOCAL_PORT), Err(BridgeError::Unsupported(_))));
    }

    #[test]
    fn test_port_add_enslaves_and_joins_vlan0() {
        let br = bridge();
        let eth1 = dev("eth1", 1);
        let handle = br.port_add(eth1.clone(), IngressDefaults::default()).unwrap();

        assert_eq!(handle.index, 1);
        assert_eq!(eth1.master().as_deref(), Some("ubr0"));
        assert!(br.active_ports().test(1));
        assert!(br.vlan(VlanId::NONE).unwrap().members.test(1));
        assert_eq!(br.port_find(eth1.as_ref()).unwrap(), 1);
        assert!(matches!(
            br.port_add(eth1, IngressDefaults::default()),
            Err(BridgeError::AlreadyMember(_))
        ));
    }

    #[test]
    fn test_port_del_releases_device() {
        let br = bridge();
        let eth1 = dev("eth1", 1);
        br.port_add(eth1.clone(), IngressDefaults::default()).unwrap();
        br.fdb().learn(MacAddress::new([2, 0, 0, 0, 0, 9]), VlanId::NONE, 1);

        br.port_del(1).unwrap();
        assert!(eth1.master().is_none());
        assert!(!br.active_ports().test(1));
        assert!(!br.vlan(VlanId::NONE).unwrap().members.test(1));
        assert!(br.fdb().is_empty());
        assert!(matches!(br.port_del(1), Err(BridgeError::NotFound(_))));

        assert!(br.quiesce(Duration::from_secs(1)));
        let again = br.port_add(dev("eth2", 2), IngressDefaults::default()).unwrap();
        assert_eq!(again.index, 1);
        assert_eq!(again.generation, 2);
    }

    #[test]
    fn test_port_del_keeps_dynamic_entries_when_configured() {
        let config = BridgeConfig {
            flush_on_port_del: false,
            ..Default::default()
        };
        let br = Bridge::new(config, Arc::new(MemoryStack::new()), Arc::new(MemoryRegistry::new())).unwrap();
        br.port_add(dev("eth1", 1), IngressDefaults::default()).unwrap();
        br.fdb().learn(MacAddress::new([2, 0, 0, 0, 0, 9]), VlanId::NONE, 1);
        br.fdb_add(
            FdbKey::mac(VlanId::NONE, MacAddress::new([2, 0, 0, 0, 0, 8])),
            PortVector::single(1),
            FdbOrigin::User,
        )
        .unwrap();

        br.port_del(1).unwrap();
        let entries = br.fdb_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].origin, FdbOrigin::Dynamic);
    }

    #[test]
    fn test_vlan_del_resets_pvid_and_flushes() {
        let br = bridge();
        br.port_add(dev("eth1", 1), IngressDefaults::default()).unwrap();
        br.vlan_add(vid(10)).unwrap();
        br.vlan_attach(vid(10), 1, false).unwrap();
        br.port_set_pvid(1, vid(10)).unwrap();
        br.fdb().learn(MacAddress::new([2, 0, 0, 0, 0, 9]), vid(10), 1);

        br.vlan_del(vid(10)).unwrap();
        assert_eq!(br.ports()[1].pvid, VlanId::NONE);
        assert!(br.fdb().is_empty());
        assert!(br.vlan(vid(10)).is_none());
        assert!(br.quiesce(Duration::from_secs(1)));
    }

    #[test]
    fn test_pvid_requires_vlan() {
        let br = bridge();
        br.port_add(dev("eth1", 1), IngressDefaults::default()).unwrap();
        assert!(matches!(br.port_set_pvid(1, vid(42)), Err(BridgeError::NotFound(_))));
        assert!(matches!(br.port_set_pvid(7, VlanId::NONE), Err(BridgeError::NotFound(_))));
    }

    #[test]
    fn test_attach_requires_port() {
        let br = bridge();
        br.vlan_add(vid(10)).unwrap();
        assert!(matches!(br.vlan_attach(vid(10), 5, true), Err(BridgeError::NotFound(_))));
        assert!(matches!(br.vlan_attach(vid(11), 0, true), Err(BridgeError::NotFound(_))));
    }

    #[test]
    fn test_detach_rejects_out_of_range_port() {
        let br = bridge();
        assert!(matches!(br.vlan_detach(VlanId::NONE, 300), Err(BridgeError::NotFound(_))));
        assert!(matches!(br.vlan_detach(VlanId::NONE, 9), Err(BridgeError::NotFound(_))));
        assert!(br.vlan(VlanId::NONE).unwrap().members.test(LOCAL_PORT));
    }

    #[test]
    fn test_port_add_rollback_on_enslave_failure() {
        #[derive(Debug)]
        struct Stubborn(MemoryDevice);

        impl NetDevice for Stubborn {
            fn name(&self) -> &str {
                self.0.name()
            }
            fn kind(&self) -> crate::device::DeviceKind {
                self.0.kind()
            }
            fn mac_address(&self) -> MacAddress {
                self.0.mac_address()
            }
            fn has_master(&self) -> bool {
                false
            }
            fn enslave(&self, _bridge: &str) -> std::result::Result<(), crate::device::DeviceError> {
                Err(crate::device::DeviceError::Rejected {
                    name: self.name().to_string(),
                    reason: "link busy".to_string(),
                })
            }
            fn release(&self) {}
            fn transmit(&self, frame: crate::frame::Frame) -> std::result::Result<(), crate::device::DeviceError> {
                self.0.transmit(frame)
            }
        }

        let br = bridge();
        let stubborn = Arc::new(Stubborn(MemoryDevice::ethernet(
            "eth9",
            MacAddress::new([2, 0, 0, 0, 0, 9]),
        )));
        assert!(matches!(
            br.port_add(stubborn, IngressDefaults::default()),
            Err(BridgeError::Busy(_))
        ));
        assert_eq!(br.ports().len(), 1);
        assert!(br.quiesce(Duration::from_secs(1)));
        assert!(!br.ports.busy().test(1));
    }

    #[tokio::test]
    async fn test_start_ageing_once() {
        let br = bridge();
        br.start_ageing().unwrap();
        assert!(matches!(br.start_ageing(), Err(BridgeError::AlreadyExists(_))));
        br.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_ageing() {
        let br = bridge();
        br.start_ageing().unwrap();
        tokio::task::yield_now().await;
        let fdb = Arc::downgrade(&br.fdb);

        drop(br);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fdb.upgrade().is_none());
    }

    #[test]
    fn test_start_ageing_needs_runtime() {
        let br = bridge();
        assert!(matches!(br.start_ageing(), Err(BridgeError::Unsupported(_))));
    }
}
