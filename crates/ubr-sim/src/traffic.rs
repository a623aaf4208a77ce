//! Synthetic traffic generators.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use ubr_bridge::{
    Bridge, DropReason, EtherType, Frame, MacAddress, PortHandle, Verdict, VlanId, VlanTag,
};

/// Traffic parameters for one ingress port.
#[derive(Debug, Clone)]
pub struct PortTraffic {
    pub port: String,
    /// Position of the port in the topology; keeps station addresses apart.
    pub ordinal: u16,
    pub frames: u64,
    pub stations: u16,
    /// Every port's station count, indexed by ordinal.
    pub peers: Vec<u16>,
    pub tagged_vlans: Vec<VlanId>,
    pub broadcast_percent: u8,
    pub seed: u64,
}

/// Per-worker verdict tally.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerReport {
    pub port: String,
    pub sent: u64,
    pub delivered: u64,
    pub trapped: u64,
    pub dropped: BTreeMap<String, u64>,
}

impl WorkerReport {
    fn record(&mut self, verdict: Verdict) {
        self.sent += 1;
        match verdict {
            Verdict::Delivered(_) => self.delivered += 1,
            Verdict::Trapped => self.trapped += 1,
            Verdict::Dropped(reason) => *self.dropped.entry(reason.to_string()).or_default() += 1,
        }
    }
}

/// Station address `n` behind the port at `ordinal`.
pub fn station(ordinal: u16, n: u16) -> MacAddress {
    let [oh, ol] = ordinal.to_be_bytes();
    let [nh, nl] = n.to_be_bytes();
    MacAddress::new([0x02, 0x5e, oh, ol, nh, nl])
}

fn build_frame(dst: MacAddress, src: MacAddress, tag: Option<VlanId>) -> Frame {
    let frame = Frame::ethernet(dst, src, EtherType::IPV4, &[0u8; 46]);
    match tag {
        Some(vid) => Frame::with_tag(frame.data().to_vec(), VlanTag::new(EtherType::VLAN_8021Q, vid)),
        None => frame,
    }
}

fn current_handle(bridge: &Bridge, port: &str) -> Option<PortHandle> {
    let index = bridge.port_index(port).ok()?;
    bridge.port_handle(index).ok()
}

/// Sends `traffic.frames` frames into `bridge` from `traffic.port`.
///
/// A port that disappears mid-run is looked up again by name; frames sent
/// while it is absent count as dropped.
pub fn run_port(bridge: Arc<Bridge>, traffic: PortTraffic, stop: Arc<AtomicBool>) -> WorkerReport {
    let mut rng = StdRng::seed_from_u64(traffic.seed ^ u64::from(traffic.ordinal));
    let mut report = WorkerReport {
        port: traffic.port.clone(),
        ..Default::default()
    };
    let mut handle = current_handle(&bridge, &traffic.port);

    debug!(port = %traffic.port, frames = traffic.frames, "traffic worker started");
    while report.sent < traffic.frames && !stop.load(Ordering::Relaxed) {
        let src = station(traffic.ordinal, rng.gen_range(0..traffic.stations));
        let dst = if rng.gen_range(0..100u8) < traffic.broadcast_percent {
            MacAddress::BROADCAST
        } else {
            let peer = rng.gen_range(0..traffic.peers.len());
            let n = rng.gen_range(0..traffic.peers[peer].max(1));
            station(peer as u16, n)
        };
        let tag = if traffic.tagged_vlans.is_empty() || rng.gen_bool(0.5) {
            None
        } else {
            Some(traffic.tagged_vlans[rng.gen_range(0..traffic.tagged_vlans.len())])
        };

        let Some(ingress) = handle else {
            report.record(Verdict::Dropped(DropReason::PortInactive));
            handle = current_handle(&bridge, &traffic.port);
            std::thread::yield_now();
            continue;
        };
        let verdict = bridge.receive(ingress, build_frame(dst, src, tag));
        trace!(port = %traffic.port, ?verdict, "frame sent");
        if verdict == Verdict::Dropped(DropReason::PortInactive) {
            handle = current_handle(&bridge, &traffic.port);
        }
        report.record(verdict);
    }
    debug!(port = %traffic.port, sent = report.sent, "traffic worker finished");
    report
}
