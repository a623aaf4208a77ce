//! VLAN database and ingress classification.
//!
//! The VID → [`Vlan`] map is a published snapshot replaced on create/delete.
//! Membership, tagging and flood policy are [`AtomicPortVector`]s flipped in
//! place. Updates publish the more restrictive bit first: membership before
//! the tagged bit on attach, the tagged bit before membership on detach.

use crate::error::{BridgeError, Result};
use crate::forward::DropReason;
use crate::frame::Frame;
use crate::port::Port;
use crate::portvec::{AtomicPortVector, PortIndex, PortVector};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use ubr_types::{EtherType, VlanId};

/// Frame class selecting a flood vector on FDB miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloodClass {
    Unicast,
    Multicast,
    Broadcast,
}

pub struct Vlan {
    vid: VlanId,
    members: AtomicPortVector,
    tagged: AtomicPortVector,
    unicast_flood: AtomicPortVector,
    multicast_flood: AtomicPortVector,
    broadcast_flood: AtomicPortVector,
    routers: AtomicPortVector,
    learning: AtomicBool,
}

impl Vlan {
    fn new(vid: VlanId, learning: bool) -> Self {
        Self {
            vid,
            members: AtomicPortVector::default(),
            tagged: AtomicPortVector::default(),
            unicast_flood: AtomicPortVector::default(),
            multicast_flood: AtomicPortVector::default(),
            broadcast_flood: AtomicPortVector::default(),
            routers: AtomicPortVector::default(),
            learning: AtomicBool::new(learning),
        }
    }

    pub fn vid(&self) -> VlanId {
        self.vid
    }

    pub fn members(&self) -> PortVector {
        self.members.load()
    }

    pub fn tagged(&self) -> PortVector {
        self.tagged.load()
    }

    pub fn is_member(&self, port: PortIndex) -> bool {
        self.members.test(port)
    }

    pub fn is_tagged(&self, port: PortIndex) -> bool {
        self.tagged.test(port)
    }

    pub fn routers(&self) -> PortVector {
        self.routers.load()
    }

    pub fn learning(&self) -> bool {
        self.learning.load(Ordering::Acquire)
    }

    fn flood_vector(&self, class: FloodClass) -> &AtomicPortVector {
        match class {
            FloodClass::Unicast => &self.unicast_flood,
            FloodClass::Multicast => &self.multicast_flood,
            FloodClass::Broadcast => &self.broadcast_flood,
        }
    }

    pub fn flood(&self, class: FloodClass) -> PortVector {
        self.flood_vector(class).load()
    }

    /// Flood bits are initialized only for a new member; an existing member
    /// keeps its flood policy and only changes tagging.
    fn attach(&self, port: PortIndex, tagged: bool) {
        if !self.members.test(port) {
            self.members.set(port);
            self.unicast_flood.set(port);
            self.multicast_flood.set(port);
            self.broadcast_flood.set(port);
        }
        if tagged {
            self.tagged.set(port);
        } else {
            self.tagged.clear(port);
        }
    }

    /// Returns false if `port` was not a member.
    fn detach(&self, port: PortIndex) -> bool {
        let was_member = self.members.test(port);
        self.tagged.clear(port);
        self.members.clear(port);
        self.unicast_flood.clear(port);
        self.multicast_flood.clear(port);
        self.broadcast_flood.clear(port);
        self.routers.clear(port);
        was_member
    }

    pub fn info(&self) -> VlanInfo {
        VlanInfo {
            vid: self.vid,
            members: self.members(),
            tagged: self.tagged(),
            unicast_flood: self.flood(FloodClass::Unicast),
            multicast_flood: self.flood(FloodClass::Multicast),
            broadcast_flood: self.flood(FloodClass::Broadcast),
            routers: self.routers(),
            learning: self.learning(),
        }
    }
}

impl fmt::Debug for Vlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vlan")
            .field("vid", &self.vid)
            .field("members", &self.members)
            .field("tagged", &self.tagged)
            .field("learning", &self.learning())
            .finish_non_exhaustive()
    }
}

/// Serializable view of one VLAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanInfo {
    pub vid: VlanId,
    pub members: PortVector,
    pub tagged: PortVector,
    pub unicast_flood: PortVector,
    pub multicast_flood: PortVector,
    pub broadcast_flood: PortVector,
    pub routers: PortVector,
    pub learning: bool,
}

/// Result of ingress classification.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Effective VID after PVID substitution.
    pub vid: VlanId,
    /// Resolved VLAN; `None` if the VID is not configured.
    pub vlan: Option<Arc<Vlan>>,
    /// Ingress may forward on `vlan`.
    pub vlan_ok: bool,
}

type VlanMap = BTreeMap<VlanId, Arc<Vlan>>;

pub struct VlanDb {
    vlans: RwLock<Arc<VlanMap>>,
}

impl VlanDb {
    /// Creates the database with VLAN 0 present.
    pub fn new(default_learning: bool) -> Self {
        let mut map = VlanMap::new();
        map.insert(VlanId::NONE, Arc::new(Vlan::new(VlanId::NONE, default_learning)));
        Self {
            vlans: RwLock::new(Arc::new(map)),
        }
    }

    fn snapshot(&self) -> Arc<VlanMap> {
        self.vlans.read().clone()
    }

    fn publish(&self, map: VlanMap) {
        *self.vlans.write() = Arc::new(map);
    }

    pub fn create(&self, vid: VlanId, learning: bool) -> Result<Arc<Vlan>> {
        let snapshot = self.snapshot();
        if snapshot.contains_key(&vid) {
            return Err(BridgeError::AlreadyExists(format!("vlan {vid}")));
        }
        let vlan = Arc::new(Vlan::new(vid, learning));
        let mut map = (*snapshot).clone();
        map.insert(vid, vlan.clone());
        self.publish(map);
        Ok(vlan)
    }

    /// Unpublishes `vid` and returns the record for deferred release.
    ///
    /// Membership is cleared first so readers still holding the record stop
    /// forwarding on it.
    pub fn delete(&self, vid: VlanId) -> Result<Arc<Vlan>> {
        if vid.is_none() {
            return Err(BridgeError::Unsupported("vlan 0 cannot be deleted".to_string()));
        }
        let snapshot = self.snapshot();
        let vlan = snapshot
            .get(&vid)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("vlan {vid}")))?;

        for port in vlan.members().iter() {
            vlan.detach(port);
        }
        let mut map = (*snapshot).clone();
        map.remove(&vid);
        self.publish(map);
        Ok(vlan)
    }

    pub fn find(&self, vid: VlanId) -> Option<Arc<Vlan>> {
        self.snapshot().get(&vid).cloned()
    }

    fn get(&self, vid: VlanId) -> Result<Arc<Vlan>> {
        self.find(vid)
            .ok_or_else(|| BridgeError::NotFound(format!("vlan {vid}")))
    }

    /// Adds `port` to `vid`, or changes its tagging mode if already a member.
    pub fn attach(&self, vid: VlanId, port: PortIndex, tagged: bool) -> Result<()> {
        self.get(vid)?.attach(port, tagged);
        Ok(())
    }

    pub fn detach(&self, vid: VlanId, port: PortIndex) -> Result<()> {
        let vlan = self.get(vid)?;
        if !vlan.detach(port) {
            return Err(BridgeError::NotFound(format!("port {port} in vlan {vid}")));
        }
        Ok(())
    }

    /// Removes `port` from every VLAN. Returns the VIDs it was a member of.
    pub fn detach_all(&self, port: PortIndex) -> Vec<VlanId> {
        self.snapshot()
            .values()
            .filter(|vlan| vlan.detach(port))
            .map(|vlan| vlan.vid)
            .collect()
    }

    pub fn set_learning(&self, vid: VlanId, enabled: bool) -> Result<()> {
        self.get(vid)?.learning.store(enabled, Ordering::Release);
        Ok(())
    }

    pub fn set_flood(&self, vid: VlanId, class: FloodClass, port: PortIndex, enabled: bool) -> Result<()> {
        let vlan = self.get(vid)?;
        let vector = vlan.flood_vector(class);
        if enabled {
            vector.set(port);
        } else {
            vector.clear(port);
        }
        Ok(())
    }

    pub fn set_router(&self, vid: VlanId, port: PortIndex, enabled: bool) -> Result<()> {
        let vlan = self.get(vid)?;
        if enabled {
            vlan.routers.set(port);
        } else {
            vlan.routers.clear(port);
        }
        Ok(())
    }

    /// All VLANs in VID order.
    pub fn list(&self) -> Vec<Arc<Vlan>> {
        self.snapshot().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves the VLAN of a frame received on `port`.
    ///
    /// Moves an in-band `proto` tag out of the buffer, rewrites a tag of
    /// another protocol to `proto`, substitutes the port PVID for untagged and
    /// priority-tagged frames, then checks membership.
    pub fn classify(&self, port: &Port, frame: &mut Frame, proto: EtherType) -> std::result::Result<Classification, DropReason> {
        if frame.tag().is_none() {
            frame
                .untag_inband(proto)
                .map_err(|_| DropReason::TagParse)?;
        }

        let tag = frame.tag();
        if let Some(tag) = tag {
            if tag.proto != proto {
                frame.set_tag(Some(tag.with_proto(proto)));
            }
        }

        let vid = match tag {
            Some(tag) if !tag.is_priority_only() => tag.vid,
            _ => port.pvid(),
        };

        let vlan = self.find(vid);
        let vlan_ok = match &vlan {
            Some(vlan) => vlan.is_member(port.index()) || !port.ingress_defaults().vlan_filtering,
            None => false,
        };
        Ok(Classification { vid, vlan, vlan_ok })
    }
}

impl fmt::Debug for VlanDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.snapshot().keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::port::{IngressDefaults, PortTable};
    use pretty_assertions::assert_eq;
    use ubr_types::{MacAddress, VlanTag};

    fn vid(id: u16) -> VlanId {
        VlanId::new(id).unwrap()
    }

    fn port_table() -> (PortTable, Arc<Port>) {
        let table = PortTable::new("br0");
        let dev = Arc::new(MemoryDevice::ethernet("eth1", MacAddress::new([2, 0, 0, 0, 0, 1])));
        let port = table.add(dev, IngressDefaults::default(), "br0").unwrap();
        (table, port)
    }

    fn frame() -> Frame {
        Frame::ethernet(
            MacAddress::BROADCAST,
            MacAddress::new([2, 0, 0, 0, 0, 9]),
            EtherType::ARP,
            &[0; 28],
        )
    }

    #[test]
    fn test_vlan0_always_present() {
        let db = VlanDb::new(true);
        assert!(db.find(VlanId::NONE).is_some());
        assert!(matches!(db.delete(VlanId::NONE), Err(BridgeError::Unsupported(_))));
        assert!(matches!(db.create(VlanId::NONE, true), Err(BridgeError::AlreadyExists(_))));
    }

    #[test]
    fn test_create_delete() {
        let db = VlanDb::new(true);
        db.create(vid(10), false).unwrap();
        assert!(!db.find(vid(10)).unwrap().learning());
        assert!(matches!(db.create(vid(10), true), Err(BridgeError::AlreadyExists(_))));

        db.attach(vid(10), 3, true).unwrap();
        let removed = db.delete(vid(10)).unwrap();
        assert!(removed.members().is_empty());
        assert!(removed.tagged().is_empty());
        assert!(db.find(vid(10)).is_none());
        assert!(matches!(db.delete(vid(10)), Err(BridgeError::NotFound(_))));
    }

    #[test]
    fn test_attach_sets_floods_and_tagging() {
        let db = VlanDb::new(true);
        db.create(vid(10), true).unwrap();
        db.attach(vid(10), 2, true).unwrap();

        let vlan = db.find(vid(10)).unwrap();
        let info = vlan.info();
        assert_eq!(info.members, PortVector::single(2));
        assert_eq!(info.tagged, PortVector::single(2));
        assert_eq!(info.unicast_flood, PortVector::single(2));
        assert_eq!(info.broadcast_flood, PortVector::single(2));

        // Re-attach untagged switches the mode.
        db.attach(vid(10), 2, false).unwrap();
        assert!(vlan.tagged().is_empty());
        assert!(vlan.is_member(2));
    }

    #[test]
    fn test_detach() {
        let db = VlanDb::new(true);
        db.create(vid(10), true).unwrap();
        db.attach(vid(10), 2, true).unwrap();
        db.set_router(vid(10), 2, true).unwrap();

        db.detach(vid(10), 2).unwrap();
        let info = db.find(vid(10)).unwrap().info();
        assert!(info.members.is_empty());
        assert!(info.tagged.is_empty());
        assert!(info.routers.is_empty());
        assert!(matches!(db.detach(vid(10), 2), Err(BridgeError::NotFound(_))));
    }

    #[test]
    fn test_detach_all() {
        let db = VlanDb::new(true);
        db.create(vid(10), true).unwrap();
        db.create(vid(20), true).unwrap();
        db.attach(VlanId::NONE, 4, false).unwrap();
        db.attach(vid(20), 4, true).unwrap();

        assert_eq!(db.detach_all(4), vec![VlanId::NONE, vid(20)]);
        assert!(db.list().iter().all(|v| !v.is_member(4)));
    }

    #[test]
    fn test_set_flood() {
        let db = VlanDb::new(true);
        db.attach(VlanId::NONE, 1, false).unwrap();
        db.set_flood(VlanId::NONE, FloodClass::Unicast, 1, false).unwrap();
        let vlan = db.find(VlanId::NONE).unwrap();
        assert!(vlan.flood(FloodClass::Unicast).is_empty());
        assert!(vlan.flood(FloodClass::Multicast).test(1));
    }

    #[test]
    fn test_reattach_keeps_flood_policy() {
        let db = VlanDb::new(true);
        db.attach(VlanId::NONE, 1, false).unwrap();
        db.set_flood(VlanId::NONE, FloodClass::Unicast, 1, false).unwrap();

        db.attach(VlanId::NONE, 1, true).unwrap();
        let vlan = db.find(VlanId::NONE).unwrap();
        assert!(vlan.is_tagged(1));
        assert!(!vlan.flood(FloodClass::Unicast).test(1));
        assert!(vlan.flood(FloodClass::Broadcast).test(1));

        // A fresh attach after detach starts from the default policy again.
        db.detach(VlanId::NONE, 1).unwrap();
        db.attach(VlanId::NONE, 1, false).unwrap();
        assert!(vlan.flood(FloodClass::Unicast).test(1));
    }

    #[test]
    fn test_classify_untagged_uses_pvid() {
        let (_table, port) = port_table();
        let db = VlanDb::new(true);
        db.attach(VlanId::NONE, port.index(), false).unwrap();

        let mut f = frame();
        let c = db.classify(&port, &mut f, EtherType::VLAN_8021Q).unwrap();
        assert_eq!(c.vid, VlanId::NONE);
        assert!(c.vlan_ok);

        db.create(vid(10), true).unwrap();
        port.set_pvid(vid(10));
        let c = db.classify(&port, &mut frame(), EtherType::VLAN_8021Q).unwrap();
        assert_eq!(c.vid, vid(10));
        assert!(c.vlan.is_some());
        assert!(!c.vlan_ok);
    }

    #[test]
    fn test_classify_inband_tag() {
        let (_table, port) = port_table();
        let db = VlanDb::new(true);
        db.create(vid(10), true).unwrap();
        db.attach(vid(10), port.index(), true).unwrap();

        let mut f = Frame::ethernet(
            MacAddress::BROADCAST,
            MacAddress::new([2, 0, 0, 0, 0, 9]),
            EtherType::VLAN_8021Q,
            &[0x00, 0x0a, 0x08, 0x06, 0, 0],
        );
        let c = db.classify(&port, &mut f, EtherType::VLAN_8021Q).unwrap();
        assert_eq!(c.vid, vid(10));
        assert!(c.vlan_ok);
        assert_eq!(f.ethertype(), Some(EtherType::ARP));
    }

    #[test]
    fn test_classify_bad_tag_drops() {
        let (_table, port) = port_table();
        let db = VlanDb::new(true);
        let mut f = Frame::ethernet(
            MacAddress::BROADCAST,
            MacAddress::new([2, 0, 0, 0, 0, 9]),
            EtherType::VLAN_8021Q,
            &[0x0f, 0xff, 0x08, 0x06],
        );
        assert_eq!(
            db.classify(&port, &mut f, EtherType::VLAN_8021Q).unwrap_err(),
            DropReason::TagParse
        );
    }

    #[test]
    fn test_classify_foreign_tag_reencoded() {
        let (_table, port) = port_table();
        let db = VlanDb::new(true);
        db.create(vid(30), true).unwrap();
        db.attach(vid(30), port.index(), true).unwrap();

        let mut tag = VlanTag::new(EtherType::VLAN_8021AD, vid(30));
        tag.pcp = 5;
        let mut f = frame();
        f.set_tag(Some(tag));
        let c = db.classify(&port, &mut f, EtherType::VLAN_8021Q).unwrap();
        assert_eq!(c.vid, vid(30));
        let rewritten = f.tag().unwrap();
        assert_eq!(rewritten.proto, EtherType::VLAN_8021Q);
        assert_eq!(rewritten.pcp, 5);
    }

    #[test]
    fn test_classify_unknown_vlan_not_ok() {
        let (_table, port) = port_table();
        let db = VlanDb::new(true);
        let mut f = frame();
        f.set_tag(Some(VlanTag::new(EtherType::VLAN_8021Q, vid(99))));
        let c = db.classify(&port, &mut f, EtherType::VLAN_8021Q).unwrap();
        assert!(c.vlan.is_none());
        assert!(!c.vlan_ok);
    }

    #[test]
    fn test_classify_without_filtering() {
        let (_table, port) = port_table();
        port.set_ingress_defaults(IngressDefaults {
            vlan_filtering: false,
            learning: true,
        });
        let db = VlanDb::new(true);
        db.create(vid(10), true).unwrap();
        let mut f = frame();
        f.set_tag(Some(VlanTag::new(EtherType::VLAN_8021Q, vid(10))));
        assert!(db.classify(&port, &mut f, EtherType::VLAN_8021Q).unwrap().vlan_ok);
    }

    #[test]
    fn test_tagged_subset_of_members_under_churn() {
        let db = Arc::new(VlanDb::new(true));
        db.create(vid(10), true).unwrap();
        let vlan = db.find(vid(10)).unwrap();

        // While ports are only being added, tagged is read before members;
        // while they are only being removed, members before tagged. Either
        // way a reader must never see a tagged port that is not a member.
        for attaching in [true, false] {
            let stop = Arc::new(AtomicBool::new(false));
            let readers: Vec<_> = (0..3)
                .map(|_| {
                    let vlan = vlan.clone();
                    let stop = stop.clone();
                    std::thread::spawn(move || {
                        while !stop.load(Ordering::Relaxed) {
                            let (t, m) = if attaching {
                                let t = vlan.tagged();
                                (t, vlan.members())
                            } else {
                                let m = vlan.members();
                                (vlan.tagged(), m)
                            };
                            assert!(t.is_subset(&m), "tagged {t:?} not within members {m:?}");
                        }
                    })
                })
                .collect();

            for port in 1..200 {
                if attaching {
                    db.attach(vid(10), port, port % 2 == 0).unwrap();
                } else {
                    db.detach(vid(10), port).unwrap();
                }
            }
            stop.store(true, Ordering::Relaxed);
            for r in readers {
                r.join().unwrap();
            }
        }
        assert!(vlan.members().is_empty());
    }
}
