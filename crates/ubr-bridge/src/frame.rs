//! Ethernet frame buffer as seen by the forwarding pipeline.
//!
//! A [`Frame`] holds the frame bytes without any VLAN tag the ingress device
//! already decoded, plus that decoded tag out of band. Egress rewrites only
//! the out-of-band tag; [`Frame::into_wire`] produces the on-the-wire bytes
//! for devices that need them.

use std::collections::TryReserveError;
use std::net::{Ipv4Addr, Ipv6Addr};
use ubr_types::{EtherType, MacAddress, ParseError, VlanTag, ETH_ALEN, ETH_HLEN, VLAN_HLEN};

const ETHERTYPE_OFFSET: usize = 2 * ETH_ALEN;
const IPV4_DST_OFFSET: usize = 16;
const IPV6_DST_OFFSET: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    tag: Option<VlanTag>,
}

impl Frame {
    /// Wraps raw frame bytes received without an offloaded tag.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, tag: None }
    }

    /// Wraps frame bytes whose outer tag was already stripped by the device.
    pub fn with_tag(data: Vec<u8>, tag: VlanTag) -> Self {
        Self {
            data,
            tag: Some(tag),
        }
    }

    /// Builds an untagged frame from header fields and payload.
    pub fn ethernet(dst: MacAddress, src: MacAddress, ethertype: EtherType, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(ETH_HLEN + payload.len());
        data.extend_from_slice(dst.as_bytes());
        data.extend_from_slice(src.as_bytes());
        data.extend_from_slice(&ethertype.as_u16().to_be_bytes());
        data.extend_from_slice(payload);
        Self::new(data)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True if the buffer holds at least a full Ethernet header.
    pub fn has_header(&self) -> bool {
        self.data.len() >= ETH_HLEN
    }

    pub fn dst(&self) -> Option<MacAddress> {
        MacAddress::from_slice(&self.data)
    }

    pub fn src(&self) -> Option<MacAddress> {
        MacAddress::from_slice(self.data.get(ETH_ALEN..)?)
    }

    /// Ether-type of the (possibly in-band tagged) payload.
    pub fn ethertype(&self) -> Option<EtherType> {
        let b = self.data.get(ETHERTYPE_OFFSET..ETH_HLEN)?;
        Some(EtherType(u16::from_be_bytes([b[0], b[1]])))
    }

    pub fn payload(&self) -> &[u8] {
        self.data.get(ETH_HLEN..).unwrap_or(&[])
    }

    /// The out-of-band tag, if any.
    pub fn tag(&self) -> Option<VlanTag> {
        self.tag
    }

    pub fn set_tag(&mut self, tag: Option<VlanTag>) {
        self.tag = tag;
    }

    /// Moves an in-band tag of protocol `proto` out of the buffer.
    ///
    /// Returns `Ok(None)` when the payload is not tagged with `proto`.
    pub fn untag_inband(&mut self, proto: EtherType) -> Result<Option<VlanTag>, ParseError> {
        if self.ethertype() != Some(proto) {
            return Ok(None);
        }
        let tag = VlanTag::parse_tci(proto, self.payload())?;
        // The inner ether-type must be present for the result to be a frame.
        if self.data.len() < ETH_HLEN + VLAN_HLEN {
            return Err(ParseError::TruncatedTag(self.data.len() - ETH_HLEN));
        }
        self.data.drain(ETHERTYPE_OFFSET..ETHERTYPE_OFFSET + VLAN_HLEN);
        self.tag = Some(tag);
        Ok(Some(tag))
    }

    /// Destination group of an IPv4 payload.
    pub fn ipv4_dst(&self) -> Option<Ipv4Addr> {
        if self.ethertype() != Some(EtherType::IPV4) {
            return None;
        }
        let b = self.payload().get(IPV4_DST_OFFSET..IPV4_DST_OFFSET + 4)?;
        Some(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    }

    /// Destination group of an IPv6 payload.
    pub fn ipv6_dst(&self) -> Option<Ipv6Addr> {
        if self.ethertype() != Some(EtherType::IPV6) {
            return None;
        }
        let b: [u8; 16] = self
            .payload()
            .get(IPV6_DST_OFFSET..IPV6_DST_OFFSET + 16)?
            .try_into()
            .ok()?;
        Some(Ipv6Addr::from(b))
    }

    /// Copies the frame, reporting allocation failure instead of aborting.
    pub fn try_clone(&self) -> Result<Frame, TryReserveError> {
        let mut data = Vec::new();
        reserve(&mut data, self.data.len())?;
        data.extend_from_slice(&self.data);
        Ok(Frame {
            data,
            tag: self.tag,
        })
    }

    /// The frame as transmitted: the out-of-band tag, if any, in-band.
    pub fn into_wire(self) -> Vec<u8> {
        let Some(tag) = self.tag else {
            return self.data;
        };
        let mut data = self.data;
        let at = ETHERTYPE_OFFSET.min(data.len());
        let mut hdr = [0u8; VLAN_HLEN];
        hdr[..2].copy_from_slice(&tag.proto.as_u16().to_be_bytes());
        hdr[2..].copy_from_slice(&tag.tci().to_be_bytes());
        data.splice(at..at, hdr);
        data
    }
}

fn reserve(data: &mut Vec<u8>, len: usize) -> Result<(), TryReserveError> {
    #[cfg(test)]
    let len = if clone_budget::take() { len } else { usize::MAX };
    data.try_reserve_exact(len)
}

/// Per-thread cap on successful [`Frame::try_clone`] calls, for exercising
/// allocation failure.
#[cfg(test)]
pub(crate) mod clone_budget {
    use std::cell::Cell;

    thread_local! {
        static REMAINING: Cell<Option<usize>> = const { Cell::new(None) };
    }

    /// `None` removes the cap.
    pub(crate) fn set(remaining: Option<usize>) {
        REMAINING.with(|r| r.set(remaining));
    }

    pub(super) fn take() -> bool {
        REMAINING.with(|r| match r.get() {
            None => true,
            Some(0) => false,
            Some(n) => {
                r.set(Some(n - 1));
                true
            }
        })
    }
}
