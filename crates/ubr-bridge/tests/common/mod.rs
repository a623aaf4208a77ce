//! Shared fixtures for the bridge integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use ubr_bridge::{
    Bridge, BridgeConfig, EtherType, Frame, IngressDefaults, MacAddress, MemoryDevice,
    MemoryRegistry, MemoryStack, PortHandle, VlanId, VlanTag,
};

/// A bridge with `n` in-memory Ethernet ports attached as indices 1..=n.
pub struct Lab {
    pub bridge: Arc<Bridge>,
    pub stack: Arc<MemoryStack>,
    pub registry: Arc<MemoryRegistry>,
    pub devices: Vec<Arc<MemoryDevice>>,
    pub handles: Vec<PortHandle>,
}

impl Lab {
    pub fn new(n: usize) -> Self {
        Self::with_config(BridgeConfig::default(), n)
    }

    pub fn with_config(config: BridgeConfig, n: usize) -> Self {
        let stack = Arc::new(MemoryStack::new());
        let registry = Arc::new(MemoryRegistry::new());
        let bridge = Arc::new(Bridge::new(config, stack.clone(), registry.clone()).unwrap());
        let mut lab = Self {
            bridge,
            stack,
            registry,
            devices: Vec::new(),
            handles: Vec::new(),
        };
        for i in 1..=n {
            lab.add_port(&format!("eth{i}"), i as u16);
        }
        lab
    }

    pub fn add_port(&mut self, name: &str, id: u16) -> PortHandle {
        let dev = Arc::new(device(name, id));
        self.registry.register(dev.clone());
        let handle = self
            .bridge
            .port_add(dev.clone(), IngressDefaults::default())
            .unwrap();
        self.devices.push(dev);
        self.handles.push(handle);
        handle
    }

    /// Device behind port index `index` (1-based, in creation order).
    pub fn dev(&self, index: usize) -> &Arc<MemoryDevice> {
        &self.devices[index - 1]
    }

    pub fn port(&self, index: usize) -> PortHandle {
        self.handles[index - 1]
    }

    /// Drains every device and returns the port indices that received a frame.
    pub fn receivers(&self) -> Vec<usize> {
        self.devices
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.take_sent().is_empty())
            .map(|(i, _)| i + 1)
            .collect()
    }

    pub fn drain(&self) {
        for d in &self.devices {
            d.take_sent();
        }
        self.stack.take_received();
    }
}

pub fn device(name: &str, id: u16) -> MemoryDevice {
    let [hi, lo] = id.to_be_bytes();
    MemoryDevice::ethernet(name, MacAddress::new([0x02, 0xaa, 0, 0, hi, lo]))
}

/// Station address `n`, distinct from any device address.
pub fn station(n: u8) -> MacAddress {
    MacAddress::new([0x02, 0x00, 0x5e, 0x10, 0x00, n])
}

pub fn vid(id: u16) -> VlanId {
    VlanId::new(id).unwrap()
}

pub fn frame(dst: MacAddress, src: MacAddress) -> Frame {
    Frame::ethernet(dst, src, EtherType::ARP, &[0u8; 46])
}

pub fn tagged_frame(dst: MacAddress, src: MacAddress, id: u16) -> Frame {
    Frame::with_tag(
        frame(dst, src).data().to_vec(),
        VlanTag::new(EtherType::VLAN_8021Q, vid(id)),
    )
}

pub fn ipv4_multicast(src: MacAddress, group: [u8; 4]) -> Frame {
    let dst = MacAddress::new([0x01, 0x00, 0x5e, group[1] & 0x7f, group[2], group[3]]);
    let mut ip = [0u8; 28];
    ip[0] = 0x45;
    ip[16..20].copy_from_slice(&group);
    Frame::ethernet(dst, src, EtherType::IPV4, &ip)
}
