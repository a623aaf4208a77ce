//! Device layer seam.
//!
//! The bridge does not own network interfaces. It is handed devices through
//! [`NetDevice`], validates them on port add, and transmits through them.
//! Frames for port 0 go up through [`LocalStack`]. Control requests name
//! devices; [`DeviceRegistry`] turns a name into a device.
//!
//! [`MemoryDevice`] and [`MemoryStack`] are in-memory implementations used by
//! the simulator and the test suites.

use crate::frame::Frame;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use ubr_types::MacAddress;

/// Link type as reported by the owning network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Ethernet,
    Loopback,
    Bridge,
    Tunnel,
    Other,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device {0} is not attached to a bridge")]
    Detached(String),

    #[error("device {0} already has master {1}")]
    HasMaster(String, String),

    #[error("device {name} rejected the request: {reason}")]
    Rejected { name: String, reason: String },
}

/// A network interface owned by the external network stack.
pub trait NetDevice: Send + Sync + fmt::Debug {
    /// Interface name; unique within the stack.
    fn name(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    fn mac_address(&self) -> MacAddress;

    /// True if another upper device (bridge, bond) already owns this one.
    fn has_master(&self) -> bool;

    /// False if the interface forbids being bridged.
    fn bridging_allowed(&self) -> bool {
        true
    }

    /// Records `bridge` as this device's master.
    fn enslave(&self, bridge: &str) -> Result<(), DeviceError>;

    /// Drops the master link. Subsequent transmits may be rejected.
    fn release(&self);

    fn transmit(&self, frame: Frame) -> Result<(), DeviceError>;
}

/// The bridge's own upward path into the local network stack.
pub trait LocalStack: Send + Sync + fmt::Debug {
    fn deliver_locally(&self, frame: Frame);
}

/// Name lookup of the devices known to the network stack.
pub trait DeviceRegistry: Send + Sync + fmt::Debug {
    fn lookup(&self, name: &str) -> Option<Arc<dyn NetDevice>>;
}

/// In-memory [`DeviceRegistry`].
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    devices: Mutex<HashMap<String, Arc<dyn NetDevice>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device: Arc<dyn NetDevice>) {
        self.devices
            .lock()
            .insert(device.name().to_string(), device);
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn NetDevice>> {
        self.devices.lock().remove(name)
    }
}

impl DeviceRegistry for MemoryRegistry {
    fn lookup(&self, name: &str) -> Option<Arc<dyn NetDevice>> {
        self.devices.lock().get(name).cloned()
    }
}

/// In-memory [`NetDevice`] that records or counts transmitted frames.
#[derive(Debug)]
pub struct MemoryDevice {
    name: String,
    kind: DeviceKind,
    mac: MacAddress,
    bridging_allowed: bool,
    master: Mutex<Option<String>>,
    capture: AtomicBool,
    sent: Mutex<Vec<Frame>>,
    tx_frames: AtomicU64,
    tx_rejected: AtomicU64,
}

impl MemoryDevice {
    pub fn ethernet(name: impl Into<String>, mac: MacAddress) -> Self {
        Self {
            name: name.into(),
            kind: DeviceKind::Ethernet,
            mac,
            bridging_allowed: true,
            master: Mutex::new(None),
            capture: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            tx_frames: AtomicU64::new(0),
            tx_rejected: AtomicU64::new(0),
        }
    }

    pub fn with_kind(mut self, kind: DeviceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_master(self, master: impl Into<String>) -> Self {
        *self.master.lock() = Some(master.into());
        self
    }

    pub fn without_bridging(mut self) -> Self {
        self.bridging_allowed = false;
        self
    }

    /// Counting only; transmitted frames are not retained.
    pub fn counting(self) -> Self {
        self.capture.store(false, Ordering::Relaxed);
        self
    }

    pub fn master(&self) -> Option<String> {
        self.master.lock().clone()
    }

    /// Drains the captured frames.
    pub fn take_sent(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn tx_frames(&self) -> u64 {
        self.tx_frames.load(Ordering::Relaxed)
    }

    pub fn tx_rejected(&self) -> u64 {
        self.tx_rejected.load(Ordering::Relaxed)
    }
}

impl NetDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn mac_address(&self) -> MacAddress {
        self.mac
    }

    fn has_master(&self) -> bool {
        self.master.lock().is_some()
    }

    fn bridging_allowed(&self) -> bool {
        self.bridging_allowed
    }

    fn enslave(&self, bridge: &str) -> Result<(), DeviceError> {
        let mut master = self.master.lock();
        if let Some(current) = master.as_ref() {
            return Err(DeviceError::HasMaster(self.name.clone(), current.clone()));
        }
        *master = Some(bridge.to_string());
        Ok(())
    }

    fn release(&self) {
        *self.master.lock() = None;
    }

    fn transmit(&self, frame: Frame) -> Result<(), DeviceError> {
        if self.master.lock().is_none() {
            self.tx_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(DeviceError::Detached(self.name.clone()));
        }
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
        if self.capture.load(Ordering::Relaxed) {
            self.sent.lock().push(frame);
        }
        Ok(())
    }
}

/// In-memory [`LocalStack`].
#[derive(Debug, Default)]
pub struct MemoryStack {
    received: Mutex<Vec<Frame>>,
    count: AtomicU64,
}

impl MemoryStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_received(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.received.lock())
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl LocalStack for MemoryStack {
    fn deliver_locally(&self, frame: Frame) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.received.lock().push(frame);
    }
}
