//! VLAN ID type with validation.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// IEEE 802.1Q VLAN identifier.
///
/// VID 0 is accepted and denotes "no VLAN": priority-tagged frames and the
/// bridge's implicit default domain. VID 4095 is reserved and rejected.
///
/// # Examples
///
/// ```
/// use ubr_types::VlanId;
///
/// let vlan = VlanId::new(100).unwrap();
/// assert_eq!(vlan.as_u16(), 100);
///
/// assert!(VlanId::new(0).unwrap().is_none());
/// assert!(VlanId::new(4095).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanId(u16);

impl VlanId {
    /// Maximum valid VLAN ID.
    pub const MAX: u16 = 4094;

    /// The implicit default domain (VID 0).
    pub const NONE: VlanId = VlanId(0);

    /// Creates a new VLAN ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the VLAN ID is above 4094.
    pub const fn new(id: u16) -> Result<Self, ParseError> {
        if id <= Self::MAX {
            Ok(VlanId(id))
        } else {
            Err(ParseError::InvalidVlanId(id))
        }
    }

    /// Returns the VLAN ID as a u16.
    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns true for VID 0.
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VlanId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept "vlan100" as well as "100"
        let id_str = match s.get(..4) {
            Some(prefix) if prefix.eq_ignore_ascii_case("vlan") => &s[4..],
            _ => s,
        };

        let id: u16 = id_str
            .parse()
            .map_err(|_| ParseError::InvalidVlanId(u16::MAX))?;

        VlanId::new(id)
    }
}

impl TryFrom<u16> for VlanId {
    type Error = ParseError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        VlanId::new(id)
    }
}

impl From<VlanId> for u16 {
    fn from(vlan: VlanId) -> u16 {
        vlan.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_range() {
        assert!(VlanId::new(0).is_ok());
        assert!(VlanId::new(1).is_ok());
        assert!(VlanId::new(4094).is_ok());
        assert_eq!(VlanId::new(4095), Err(ParseError::InvalidVlanId(4095)));
    }

    #[test]
    fn test_parse_vlan_prefix() {
        let vlan: VlanId = "Vlan100".parse().unwrap();
        assert_eq!(vlan.as_u16(), 100);

        let vlan: VlanId = "20".parse().unwrap();
        assert_eq!(vlan.as_u16(), 20);

        assert!("vlan".parse::<VlanId>().is_err());
        assert!("vlan5000".parse::<VlanId>().is_err());
    }

    #[test]
    fn test_none() {
        assert!(VlanId::NONE.is_none());
        assert!(VlanId::default().is_none());
        assert!(!VlanId::new(10).unwrap().is_none());
    }
}
