//! Transport error taxonomy
//!
//! Addressing, negotiation and resource failures are recoverable values of
//! [`TransportError`]. Buffer-ownership contract violations are not errors:
//! they panic at the call site.

use crate::memory::shm::ShmError;

/// Identifier of a circuit inside one [`crate::transport::Transport`]
pub type CircuitId = u64;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Malformed endpoint address '{address}': {reason}")]
    MalformedAddress { address: String, reason: String },

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Mapping failed: {0}")]
    MappingFailed(String),

    #[error("Incompatible roles: {0}")]
    IncompatibleRoles(String),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Unsupported transfer pattern: {0}")]
    UnsupportedPattern(String),

    #[error("Unknown circuit: {0}")]
    UnknownCircuit(CircuitId),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Shared memory error: {0}")]
    Shm(#[from] ShmError),
}

impl TransportError {
    pub fn malformed(address: &str, reason: impl Into<String>) -> Self {
        TransportError::MalformedAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error happened while negotiating roles or options
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            TransportError::IncompatibleRoles(_) | TransportError::UnsupportedPattern(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_display() {
        let err = TransportError::malformed("shm", "missing protocol separator");
        assert_eq!(
            err.to_string(),
            "Malformed endpoint address 'shm': missing protocol separator"
        );
    }

    #[test]
    fn test_negotiation_classification() {
        assert!(TransportError::IncompatibleRoles("x".into()).is_negotiation());
        assert!(!TransportError::ResourceUnavailable("x".into()).is_negotiation());
    }
}
