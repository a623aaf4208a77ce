//! Error types for the bridge control plane

use thiserror::Error;

/// Control-plane errors. Data-plane failures are drop reasons, not errors.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Device failed an eligibility check on port add
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    /// Device is already a port of this bridge
    #[error("Device {0} is already a bridge port")]
    AlreadyMember(String),

    /// Duplicate VLAN or static FDB entry
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Unknown port, VLAN or FDB entry
    #[error("Not found: {0}")]
    NotFound(String),

    /// Port table full
    #[error("Port table full ({0} ports)")]
    CapacityExceeded(usize),

    /// Device already has a master, or the resource is in use
    #[error("Busy: {0}")]
    Busy(String),

    /// Operation not permitted on this object
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::InvalidDevice("lo: loopback".to_string());
        assert_eq!(err.to_string(), "Invalid device: lo: loopback");
    }

    #[test]
    fn test_error_capacity() {
        let err = BridgeError::CapacityExceeded(256);
        assert_eq!(err.to_string(), "Port table full (256 ports)");
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: BridgeError = io.into();
        assert!(matches!(err, BridgeError::Io(_)));
    }
}
