//! Per-frame forwarding pipeline.
//!
//! classify → learn → trap → gate → resolve → deliver. Every failure is a
//! [`DropReason`] counted in [`BridgeCounters`](crate::stats::BridgeCounters);
//! nothing on this path returns an error or panics on frame contents.

use crate::bridge::Bridge;
use crate::fdb::FdbKey;
use crate::frame::Frame;
use crate::port::{Endpoint, Port, PortHandle};
use crate::portvec::{PortIndex, PortVector};
use crate::vlan::{FloodClass, Vlan};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{trace, warn};
use ubr_types::{MacAddress, VlanId, VlanTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Shorter than an Ethernet header.
    Runt,
    /// In-band VLAN tag could not be decoded.
    TagParse,
    /// VLAN unknown, or ingress port not a member.
    VlanNotAllowed,
    /// Ingress port unknown, stale or being deleted.
    PortInactive,
    /// Destination set empty after filtering.
    NoDestination,
    /// Copy for a further destination could not be allocated.
    CloneFailure,
    /// Every destination device refused the frame.
    TransmitFailed,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::Runt => "runt",
            DropReason::TagParse => "tag-parse",
            DropReason::VlanNotAllowed => "vlan-not-allowed",
            DropReason::PortInactive => "port-inactive",
            DropReason::NoDestination => "no-destination",
            DropReason::CloneFailure => "clone-failure",
            DropReason::TransmitFailed => "transmit-failed",
        };
        f.write_str(s)
    }
}

/// Terminal state of one received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// Handed to this many ports.
    Delivered(usize),
    /// Consumed by the control-plane trap.
    Trapped,
    Dropped(DropReason),
}

/// Control-plane frame interception, consulted after learning and before
/// the VLAN gate.
pub trait ControlTrap: Send + Sync + fmt::Debug {
    fn matches(&self, ingress: PortIndex, vid: VlanId, frame: &Frame) -> bool;

    fn deliver(&self, ingress: PortIndex, vid: VlanId, frame: Frame);
}

/// FDB key to look up for `dst`, and the flood class used on a miss.
fn destination_key(frame: &Frame, vid: VlanId, dst: MacAddress) -> (Option<FdbKey>, FloodClass) {
    if dst.is_broadcast() {
        return (None, FloodClass::Broadcast);
    }
    if !dst.is_multicast() {
        return (Some(FdbKey::mac(vid, dst)), FloodClass::Unicast);
    }
    let key = if let Some(group) = frame.ipv4_dst().filter(|g| g.is_multicast()) {
        FdbKey::ipv4(vid, group)
    } else if let Some(group) = frame.ipv6_dst().filter(|g| g.is_multicast()) {
        FdbKey::ipv6(vid, group)
    } else {
        FdbKey::mac(vid, dst)
    };
    (Some(key), FloodClass::Multicast)
}

impl Bridge {
    /// Runs one frame received on `ingress` through the pipeline.
    pub fn receive(&self, ingress: PortHandle, frame: Frame) -> Verdict {
        let _guard = self.epoch.pin();
        self.counters.inc(|c| &c.rx_frames);

        let verdict = self.process(ingress, frame);
        if let Verdict::Dropped(reason) = verdict {
            self.counters.record_drop(reason);
            trace!(port = %ingress, %reason, "frame dropped");
        }
        verdict
    }

    fn process(&self, ingress: PortHandle, mut frame: Frame) -> Verdict {
        let port = match self.ports.resolve(ingress) {
            Ok(port) if self.ports.is_active(port.index()) => port,
            _ => return Verdict::Dropped(DropReason::PortInactive),
        };
        if !frame.has_header() {
            return Verdict::Dropped(DropReason::Runt);
        }
        let (Some(dst), Some(src)) = (frame.dst(), frame.src()) else {
            return Verdict::Dropped(DropReason::Runt);
        };

        let class = match self.vlans.classify(&port, &mut frame, self.proto) {
            Ok(class) => class,
            Err(reason) => return Verdict::Dropped(reason),
        };

        if let Some(vlan) = &class.vlan {
            if port.ingress_defaults().learning && vlan.learning() {
                self.fdb.learn(src, class.vid, port.index());
            }
        }

        if let Some(trap) = self.trap() {
            if trap.matches(port.index(), class.vid, &frame) {
                trap.deliver(port.index(), class.vid, frame);
                self.counters.inc(|c| &c.trapped);
                return Verdict::Trapped;
            }
        }

        let vlan = match class.vlan {
            Some(vlan) if class.vlan_ok => vlan,
            _ => return Verdict::Dropped(DropReason::VlanNotAllowed),
        };

        let (key, flood) = destination_key(&frame, class.vid, dst);
        let target = match key.and_then(|key| self.fdb.lookup(&key, &vlan)) {
            Some(ports) => {
                if key.is_some_and(|k| k.addr.is_group()) {
                    self.counters.inc(|c| &c.group_hits);
                } else {
                    self.counters.inc(|c| &c.unicast_hits);
                }
                ports
            }
            None => {
                self.counters.inc(|c| &c.flooded);
                vlan.flood(flood)
            }
        };

        let dest = self.ports.active() & *port.egress() & vlan.members() & target;
        if dest.is_empty() {
            return Verdict::Dropped(DropReason::NoDestination);
        }
        self.deliver(dest, &vlan, frame)
    }

    /// Sends `frame` to every port in `dest`, ascending. The original buffer
    /// goes to the last port; every other port gets a copy.
    fn deliver(&self, dest: PortVector, vlan: &Vlan, frame: Frame) -> Verdict {
        let slots = self.ports.snapshot();
        let count = dest.count();
        let mut original = Some(frame);
        let mut delivered = 0;
        let mut failed = 0;
        let mut clone_failed = false;

        for (n, index) in dest.iter().enumerate() {
            let Some(port) = slots.get(index).and_then(Option::as_ref) else {
                continue;
            };
            let copy = if n + 1 == count {
                original.take()
            } else {
                match original.as_ref().map(Frame::try_clone) {
                    Some(Ok(copy)) => Some(copy),
                    Some(Err(e)) => {
                        warn!(error = %e, remaining = count - n, "frame copy failed, skipping remaining ports");
                        clone_failed = true;
                        break;
                    }
                    None => None,
                }
            };
            let Some(copy) = copy else {
                break;
            };
            if self.egress(port, vlan, copy) {
                delivered += 1;
            } else {
                failed += 1;
            }
        }

        match (delivered, clone_failed) {
            (0, true) => Verdict::Dropped(DropReason::CloneFailure),
            (0, false) if failed > 0 => Verdict::Dropped(DropReason::TransmitFailed),
            (0, false) => Verdict::Dropped(DropReason::NoDestination),
            (n, clone_failed) => {
                if clone_failed {
                    self.counters.record_drop(DropReason::CloneFailure);
                }
                Verdict::Delivered(n)
            }
        }
    }

    /// Applies the egress tagging policy of `vlan` and hands the frame to
    /// the port's endpoint.
    fn egress(&self, port: &Port, vlan: &Vlan, mut frame: Frame) -> bool {
        if vlan.is_tagged(port.index()) {
            let tag = match frame.tag() {
                Some(tag) => tag.with_proto(self.proto).with_vid(vlan.vid()),
                None => VlanTag::new(self.proto, vlan.vid()),
            };
            frame.set_tag(Some(tag));
        } else {
            frame.set_tag(None);
        }

        match port.endpoint() {
            Endpoint::Local => {
                self.stack.deliver_locally(frame);
                self.counters.inc(|c| &c.local_delivered);
                true
            }
            Endpoint::Device(device) => match device.transmit(frame) {
                Ok(()) => {
                    self.counters.inc(|c| &c.tx_frames);
                    true
                }
                Err(e) => {
                    self.counters.inc(|c| &c.tx_errors);
                    trace!(port = port.index(), error = %e, "transmit rejected");
                    false
                }
            },
        }
    }
}
