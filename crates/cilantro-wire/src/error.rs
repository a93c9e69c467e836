//! Errors from the messaging layer.

use thiserror::Error;

/// Errors from the wire layer.
///
/// `Protocol`, `Configuration` and `SecurityConfig` are setup-time errors and
/// propagate to the caller. `Transport`, `Framing` and friends are runtime
/// faults; inside a receive loop they are logged rather than propagated.
#[derive(Debug, Error)]
pub enum WireError {
    /// Malformed protocol or endpoint arguments.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// A programming-contract violation (double handler, id collision, ...).
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Identity or authorization misconfiguration before a secure upgrade.
    #[error("Security configuration error: {0}")]
    SecurityConfig(String),
    /// Underlying I/O failure.
    #[error("Transport fault: {0}")]
    Transport(#[from] std::io::Error),
    /// The discovery service could not resolve a verifying key.
    #[error("Could not resolve address for verifying key {0}")]
    Resolution(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Framing error: {0}")]
    Framing(String),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Connection closed")]
    ConnectionClosed,
}

impl WireError {
    /// True when a bind failed because the address is already bound.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, Self::Transport(e) if e.kind() == std::io::ErrorKind::AddrInUse)
    }

    /// True for errors that indicate a bug rather than a transient condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::SecurityConfig(_))
    }
}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        Self::Framing(e.to_string())
    }
}

/// Alias for wire results.
pub type WireResult<T> = Result<T, WireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_in_use_detection() {
        let err = WireError::Transport(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "Address already in use",
        ));
        assert!(err.is_addr_in_use());
        assert!(!WireError::ConnectionClosed.is_addr_in_use());
        assert!(!WireError::Protocol("x".into()).is_addr_in_use());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(WireError::Configuration("dup".into()).is_fatal());
        assert!(WireError::SecurityConfig("keys".into()).is_fatal());
        assert!(!WireError::Resolution("vk".into()).is_fatal());
    }
}
