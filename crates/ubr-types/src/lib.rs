//! Common bridge types for the UBR forwarding engine.
//!
//! This crate provides type-safe representations of the link-layer
//! primitives the data plane works with:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`VlanId`]: IEEE 802.1Q VLAN identifiers (0 is the port-native domain)
//! - [`VlanTag`]: a parsed 802.1Q/802.1ad tag (protocol + TCI)
//! - [`EtherType`]: the ether-types the bridge cares about

mod ether;
mod mac;
mod vlan;

pub use ether::{EtherType, VlanTag, ETH_ALEN, ETH_HLEN, VLAN_HLEN};
pub use mac::MacAddress;
pub use vlan::VlanId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VLAN ID: {0} (must be 0-4094)")]
    InvalidVlanId(u16),

    #[error("invalid ether-type: {0}")]
    InvalidEtherType(String),

    #[error("truncated VLAN tag: {0} bytes available")]
    TruncatedTag(usize),
}
