//! Ether-types and the 802.1Q tag.

use crate::{ParseError, VlanId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a MAC address.
pub const ETH_ALEN: usize = 6;

/// Length of an untagged Ethernet header (dst, src, ether-type).
pub const ETH_HLEN: usize = 14;

/// Length of one in-band VLAN tag (TPID + TCI).
pub const VLAN_HLEN: usize = 4;

/// An Ethernet protocol identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EtherType(pub u16);

impl EtherType {
    pub const IPV4: EtherType = EtherType(0x0800);
    pub const ARP: EtherType = EtherType(0x0806);
    /// Customer VLAN tag (C-tag).
    pub const VLAN_8021Q: EtherType = EtherType(0x8100);
    pub const IPV6: EtherType = EtherType(0x86dd);
    /// Service VLAN tag (S-tag).
    pub const VLAN_8021AD: EtherType = EtherType(0x88a8);

    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// True for the two tag protocol identifiers a bridge may be configured with.
    pub const fn is_vlan(&self) -> bool {
        self.0 == Self::VLAN_8021Q.0 || self.0 == Self::VLAN_8021AD.0
    }
}

impl fmt::Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl FromStr for EtherType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "802.1q" => Ok(Self::VLAN_8021Q),
            "802.1ad" => Ok(Self::VLAN_8021AD),
            other => {
                let hex = other.strip_prefix("0x").unwrap_or(other);
                u16::from_str_radix(hex, 16)
                    .map(EtherType)
                    .map_err(|_| ParseError::InvalidEtherType(s.to_string()))
            }
        }
    }
}

/// A single VLAN tag: tag protocol plus the decoded TCI.
///
/// Priority-only tags carry VID 0; VID 4095 is rejected on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VlanTag {
    pub proto: EtherType,
    pub pcp: u8,
    pub dei: bool,
    pub vid: VlanId,
}

impl VlanTag {
    /// Tag with default priority.
    pub const fn new(proto: EtherType, vid: VlanId) -> Self {
        Self {
            proto,
            pcp: 0,
            dei: false,
            vid,
        }
    }

    /// Decodes a TCI word.
    pub fn from_tci(proto: EtherType, tci: u16) -> Result<Self, ParseError> {
        Ok(Self {
            proto,
            pcp: (tci >> 13) as u8,
            dei: tci & 0x1000 != 0,
            vid: VlanId::new(tci & 0x0fff)?,
        })
    }

    /// Encodes the TCI word.
    pub fn tci(&self) -> u16 {
        ((self.pcp as u16 & 0x7) << 13) | ((self.dei as u16) << 12) | self.vid.as_u16()
    }

    /// Priority tagged: a tag that carries no VLAN.
    pub const fn is_priority_only(&self) -> bool {
        self.vid.is_none()
    }

    /// Parses the TCI following an in-band TPID. `buf` starts at the TCI.
    pub fn parse_tci(proto: EtherType, buf: &[u8]) -> Result<Self, ParseError> {
        let tci = buf
            .get(..2)
            .ok_or(ParseError::TruncatedTag(buf.len()))?;
        Self::from_tci(proto, u16::from_be_bytes([tci[0], tci[1]]))
    }

    /// Same tag under a different protocol identifier.
    pub const fn with_proto(self, proto: EtherType) -> Self {
        Self { proto, ..self }
    }

    /// Same priority bits, different VID.
    pub const fn with_vid(self, vid: VlanId) -> Self {
        Self { vid, ..self }
    }
}
