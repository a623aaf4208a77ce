//! Data-plane and FDB counters.
//!
//! All counters are relaxed atomics. Values are diagnostic; lost updates
//! under contention are tolerated.

use crate::forward::DropReason;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BridgeCounters {
    pub rx_frames: AtomicU64,
    pub tx_frames: AtomicU64,
    pub tx_errors: AtomicU64,
    pub local_delivered: AtomicU64,
    pub trapped: AtomicU64,
    pub flooded: AtomicU64,
    pub unicast_hits: AtomicU64,
    pub group_hits: AtomicU64,

    pub learned: AtomicU64,
    pub learn_races: AtomicU64,
    pub station_moves: AtomicU64,
    pub aged: AtomicU64,
    pub flushed: AtomicU64,

    pub drop_runt: AtomicU64,
    pub drop_tag_parse: AtomicU64,
    pub drop_vlan: AtomicU64,
    pub drop_port_inactive: AtomicU64,
    pub drop_no_destination: AtomicU64,
    pub drop_clone_failure: AtomicU64,
    pub drop_tx_failed: AtomicU64,
}

/// Point-in-time copy of [`BridgeCounters`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub rx_frames: u64,
    pub tx_frames: u64,
    pub tx_errors: u64,
    pub local_delivered: u64,
    pub trapped: u64,
    pub flooded: u64,
    pub unicast_hits: u64,
    pub group_hits: u64,
    pub learned: u64,
    pub learn_races: u64,
    pub station_moves: u64,
    pub aged: u64,
    pub flushed: u64,
    pub drop_runt: u64,
    pub drop_tag_parse: u64,
    pub drop_vlan: u64,
    pub drop_port_inactive: u64,
    pub drop_no_destination: u64,
    pub drop_clone_failure: u64,
    pub drop_tx_failed: u64,
}

impl CountersSnapshot {
    pub fn dropped(&self) -> u64 {
        self.drop_runt
            + self.drop_tag_parse
            + self.drop_vlan
            + self.drop_port_inactive
            + self.drop_no_destination
            + self.drop_clone_failure
            + self.drop_tx_failed
    }
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl BridgeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, counter: impl Fn(&Self) -> &AtomicU64) {
        bump(counter(self));
    }

    pub fn add(&self, counter: impl Fn(&Self) -> &AtomicU64, n: u64) {
        if n > 0 {
            counter(self).fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn record_drop(&self, reason: DropReason) {
        bump(match reason {
            DropReason::Runt => &self.drop_runt,
            DropReason::TagParse => &self.drop_tag_parse,
            DropReason::VlanNotAllowed => &self.drop_vlan,
            DropReason::PortInactive => &self.drop_port_inactive,
            DropReason::NoDestination => &self.drop_no_destination,
            DropReason::CloneFailure => &self.drop_clone_failure,
            DropReason::TransmitFailed => &self.drop_tx_failed,
        });
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            rx_frames: read(&self.rx_frames),
            tx_frames: read(&self.tx_frames),
            tx_errors: read(&self.tx_errors),
            local_delivered: read(&self.local_delivered),
            trapped: read(&self.trapped),
            flooded: read(&self.flooded),
            unicast_hits: read(&self.unicast_hits),
            group_hits: read(&self.group_hits),
            learned: read(&self.learned),
            learn_races: read(&self.learn_races),
            station_moves: read(&self.station_moves),
            aged: read(&self.aged),
            flushed: read(&self.flushed),
            drop_runt: read(&self.drop_runt),
            drop_tag_parse: read(&self.drop_tag_parse),
            drop_vlan: read(&self.drop_vlan),
            drop_port_inactive: read(&self.drop_port_inactive),
            drop_no_destination: read(&self.drop_no_destination),
            drop_clone_failure: read(&self.drop_clone_failure),
            drop_tx_failed: read(&self.drop_tx_failed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_inc_and_snapshot() {
        let c = BridgeCounters::new();
        c.inc(|c| &c.rx_frames);
        c.inc(|c| &c.rx_frames);
        c.add(|c| &c.tx_frames, 3);
        c.record_drop(DropReason::NoDestination);
        c.record_drop(DropReason::TagParse);

        let snap = c.snapshot();
        assert_eq!(snap.rx_frames, 2);
        assert_eq!(snap.tx_frames, 3);
        assert_eq!(snap.drop_no_destination, 1);
        assert_eq!(snap.dropped(), 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snap = BridgeCounters::new().snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"station_moves\":0"));
    }
}
