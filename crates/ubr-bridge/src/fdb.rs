//! Forwarding database.
//!
//! Entries are keyed by (VID, address) where the address is a MAC or an
//! IPv4/IPv6 multicast group. The map is a [`DashMap`] of shared entries;
//! the destination vector and timestamp of an entry are atomics, so learning
//! on a known address never takes a shard write lock. Removed entries are
//! retired through the [`Epoch`] reclaimer.

use crate::epoch::Epoch;
use crate::error::{BridgeError, Result};
use crate::portvec::{AtomicPortVector, PortIndex, PortVector};
use crate::stats::BridgeCounters;
use crate::vlan::Vlan;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use ubr_types::{MacAddress, VlanId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Mac,
    Ipv4Multicast,
    Ipv6Multicast,
}

/// Address part of an FDB key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "addr", rename_all = "lowercase")]
pub enum FdbAddress {
    Mac(MacAddress),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
}

impl FdbAddress {
    pub fn kind(&self) -> AddressKind {
        match self {
            FdbAddress::Mac(_) => AddressKind::Mac,
            FdbAddress::Ipv4(_) => AddressKind::Ipv4Multicast,
            FdbAddress::Ipv6(_) => AddressKind::Ipv6Multicast,
        }
    }

    pub fn is_group(&self) -> bool {
        !matches!(self, FdbAddress::Mac(_))
    }
}

impl fmt::Display for FdbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdbAddress::Mac(mac) => fmt::Display::fmt(mac, f),
            FdbAddress::Ipv4(ip) => fmt::Display::fmt(ip, f),
            FdbAddress::Ipv6(ip) => fmt::Display::fmt(ip, f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FdbKey {
    pub vid: VlanId,
    pub addr: FdbAddress,
}

impl FdbKey {
    pub fn mac(vid: VlanId, mac: MacAddress) -> Self {
        Self {
            vid,
            addr: FdbAddress::Mac(mac),
        }
    }

    pub fn ipv4(vid: VlanId, group: Ipv4Addr) -> Self {
        Self {
            vid,
            addr: FdbAddress::Ipv4(group),
        }
    }

    pub fn ipv6(vid: VlanId, group: Ipv6Addr) -> Self {
        Self {
            vid,
            addr: FdbAddress::Ipv6(group),
        }
    }

    pub fn kind(&self) -> AddressKind {
        self.addr.kind()
    }
}

impl fmt::Display for FdbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vlan {}", self.addr, self.vid)
    }
}

/// Who installed an entry. Only dynamic entries are learned, moved and aged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FdbOrigin {
    Dynamic,
    External,
    User,
}

impl FdbOrigin {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, FdbOrigin::Dynamic)
    }
}

pub struct FdbEntry {
    key: FdbKey,
    origin: FdbOrigin,
    ports: AtomicPortVector,
    /// Nanoseconds since the owning FDB's base instant.
    last_seen: AtomicU64,
}

impl FdbEntry {
    pub fn key(&self) -> FdbKey {
        self.key
    }

    pub fn origin(&self) -> FdbOrigin {
        self.origin
    }

    pub fn ports(&self) -> PortVector {
        self.ports.load()
    }
}

impl fmt::Debug for FdbEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdbEntry")
            .field("key", &self.key)
            .field("origin", &self.origin)
            .field("ports", &self.ports)
            .finish()
    }
}

/// Serializable copy of an entry for dumps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdbRecord {
    pub key: FdbKey,
    pub ports: PortVector,
    pub origin: FdbOrigin,
    /// Milliseconds since the entry was last refreshed.
    pub idle_ms: u64,
}

/// Conjunction of optional match criteria. The default matches everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushFilter {
    pub port: Option<PortIndex>,
    pub vid: Option<VlanId>,
    pub origin: Option<FdbOrigin>,
    /// Only dynamic entries idle for longer than the ageing time.
    pub aged_only: bool,
}

impl FlushFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn port(port: PortIndex) -> Self {
        Self {
            port: Some(port),
            ..Self::default()
        }
    }

    pub fn dynamic_on_port(port: PortIndex) -> Self {
        Self {
            port: Some(port),
            origin: Some(FdbOrigin::Dynamic),
            ..Self::default()
        }
    }

    pub fn aged() -> Self {
        Self {
            origin: Some(FdbOrigin::Dynamic),
            aged_only: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnOutcome {
    /// Source is not a learnable address.
    Ignored,
    /// A static entry owns the address.
    Static,
    Learned,
    Refreshed,
    Moved,
}

pub struct Fdb {
    table: DashMap<FdbKey, Arc<FdbEntry>>,
    base: Instant,
    ageing_time: Duration,
    epoch: Arc<Epoch>,
    counters: Arc<BridgeCounters>,
}

impl Fdb {
    pub fn new(ageing_time: Duration, epoch: Arc<Epoch>, counters: Arc<BridgeCounters>) -> Self {
        Self {
            table: DashMap::new(),
            base: Instant::now(),
            ageing_time,
            epoch,
            counters,
        }
    }

    pub fn ageing_time(&self) -> Duration {
        self.ageing_time
    }

    fn stamp(&self, at: Instant) -> u64 {
        duration_ns(at.saturating_duration_since(self.base))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn get(&self, key: &FdbKey) -> Option<Arc<FdbEntry>> {
        self.table.get(key).map(|e| e.value().clone())
    }

    /// Records that `src` was seen on `port` in `vid`.
    pub fn learn(&self, src: MacAddress, vid: VlanId, port: PortIndex) -> LearnOutcome {
        self.learn_at(src, vid, port, Instant::now())
    }

    pub fn learn_at(&self, src: MacAddress, vid: VlanId, port: PortIndex, now: Instant) -> LearnOutcome {
        if !src.is_valid_unicast() {
            return LearnOutcome::Ignored;
        }
        let key = FdbKey::mac(vid, src);
        let stamp = self.stamp(now);

        let existing = self.get(&key);
        if let Some(entry) = existing {
            return self.refresh(&entry, port, stamp);
        }

        let fresh = Arc::new(FdbEntry {
            key,
            origin: FdbOrigin::Dynamic,
            ports: AtomicPortVector::new(PortVector::single(port)),
            last_seen: AtomicU64::new(stamp),
        });
        let winner = match self.table.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                None
            }
            Entry::Occupied(slot) => Some(slot.get().clone()),
        };
        match winner {
            None => {
                self.counters.inc(|c| &c.learned);
                debug!(%key, port, "fdb learn");
                LearnOutcome::Learned
            }
            Some(entry) => {
                self.counters.inc(|c| &c.learn_races);
                self.refresh(&entry, port, stamp)
            }
        }
    }

    fn refresh(&self, entry: &FdbEntry, port: PortIndex, stamp: u64) -> LearnOutcome {
        if !entry.origin.is_dynamic() {
            return LearnOutcome::Static;
        }
        let mut outcome = LearnOutcome::Refreshed;
        if !entry.ports.test(port) {
            entry.ports.store_single(port);
            self.counters.inc(|c| &c.station_moves);
            debug!(key = %entry.key, port, "fdb station move");
            outcome = LearnOutcome::Moved;
        }
        entry.last_seen.fetch_max(stamp, Ordering::AcqRel);
        outcome
    }

    /// Destination set for `key`. Group entries also reach the VLAN's
    /// multicast routers.
    pub fn lookup(&self, key: &FdbKey, vlan: &Vlan) -> Option<PortVector> {
        let entry = self.table.get(key)?;
        let ports = entry.ports.load();
        trace!(%key, ?ports, "fdb hit");
        if key.addr.is_group() {
            Some(ports | vlan.routers())
        } else {
            Some(ports)
        }
    }

    /// Installs an External or User entry. A dynamic entry under the same key
    /// is replaced; a static one is not.
    pub fn add_static(&self, key: FdbKey, ports: PortVector, origin: FdbOrigin) -> Result<()> {
        if origin.is_dynamic() {
            return Err(BridgeError::Unsupported(
                "dynamic entries are only learned".to_string(),
            ));
        }
        if ports.is_empty() {
            return Err(BridgeError::Unsupported(format!("{key}: empty port set")));
        }
        if let FdbAddress::Mac(mac) = key.addr {
            if mac.is_zero() {
                return Err(BridgeError::Unsupported(format!("{key}: zero address")));
            }
        }

        let entry = Arc::new(FdbEntry {
            key,
            origin,
            ports: AtomicPortVector::new(ports),
            last_seen: AtomicU64::new(self.stamp(Instant::now())),
        });
        let replaced = match self.table.entry(key) {
            Entry::Occupied(mut slot) => {
                if !slot.get().origin.is_dynamic() {
                    return Err(BridgeError::AlreadyExists(key.to_string()));
                }
                Some(slot.insert(entry))
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
                None
            }
        };
        if let Some(old) = replaced {
            self.epoch.retire(move || drop(old));
        }
        debug!(%key, ?ports, ?origin, "fdb static add");
        Ok(())
    }

    pub fn remove(&self, key: &FdbKey) -> Result<()> {
        let (_, entry) = self
            .table
            .remove(key)
            .ok_or_else(|| BridgeError::NotFound(key.to_string()))?;
        self.epoch.retire(move || drop(entry));
        debug!(%key, "fdb remove");
        Ok(())
    }

    pub fn flush(&self, filter: &FlushFilter) -> usize {
        self.flush_at(filter, Instant::now())
    }

    /// Removes every entry matching `filter`. A port filter on an entry that
    /// also points elsewhere clears only that port's bit.
    ///
    /// Candidates are collected under shard read locks, then removed one key
    /// at a time with the filter checked again under the write lock, so a
    /// sweep never holds a shard against learners for a whole scan.
    pub fn flush_at(&self, filter: &FlushFilter, now: Instant) -> usize {
        let now = self.stamp(now);
        let ageing = duration_ns(self.ageing_time);
        let matches = |key: &FdbKey, entry: &Arc<FdbEntry>| {
            if filter.vid.is_some_and(|vid| vid != key.vid) {
                return false;
            }
            if filter.origin.is_some_and(|origin| origin != entry.origin) {
                return false;
            }
            if filter.aged_only {
                let idle = now.saturating_sub(entry.last_seen.load(Ordering::Acquire));
                if !entry.origin.is_dynamic() || idle <= ageing {
                    return false;
                }
            }
            match filter.port {
                Some(port) => entry.ports.test(port),
                None => true,
            }
        };

        let candidates: Vec<FdbKey> = self
            .table
            .iter()
            .filter(|e| matches(e.key(), e.value()))
            .map(|e| *e.key())
            .collect();

        let mut removed = Vec::new();
        for key in candidates {
            let hit = self.table.remove_if(&key, |key, entry| {
                if !matches(key, entry) {
                    return false;
                }
                match filter.port {
                    Some(port) => {
                        entry.ports.clear(port);
                        entry.ports.load().is_empty()
                    }
                    None => true,
                }
            });
            if let Some((_, entry)) = hit {
                removed.push(entry);
            }
        }

        let count = removed.len();
        if count > 0 {
            self.epoch.retire(move || drop(removed));
            debug!(?filter, count, "fdb flush");
        }
        count
    }

    /// Ages out idle dynamic entries.
    pub fn sweep(&self, now: Instant) -> usize {
        let aged = self.flush_at(&FlushFilter::aged(), now);
        self.counters.add(|c| &c.aged, aged as u64);
        aged
    }

    /// Copies every entry, ordered by key.
    pub fn entries(&self) -> Vec<FdbRecord> {
        let now = self.stamp(Instant::now());
        let mut records: Vec<FdbRecord> = self
            .table
            .iter()
            .map(|e| FdbRecord {
                key: *e.key(),
                ports: e.ports.load(),
                origin: e.origin,
                idle_ms: now.saturating_sub(e.last_seen.load(Ordering::Acquire)) / 1_000_000,
            })
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}

impl fmt::Debug for Fdb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fdb")
            .field("entries", &self.table.len())
            .field("ageing_time", &self.ageing_time())
            .finish()
    }
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
