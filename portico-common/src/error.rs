//! Error types for Portico

use thiserror::Error;

/// Main error type for Portico transport and session operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The broker refused the tunnel registration
    #[error("Registration rejected: {0}")]
    Registration(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection error
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The control connection was closed while an operation was pending
    #[error("Control connection {0} closed")]
    ConnectionClosed(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A frame would not fit under the negotiated frame size limit
    #[error("Frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TunnelError>;

impl From<serde_json::Error> for TunnelError {
    fn from(err: serde_json::Error) -> Self {
        TunnelError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::Registration("port already in use".to_string());
        assert_eq!(err.to_string(), "Registration rejected: port already in use");
    }

    #[test]
    fn test_frame_too_large_display() {
        let err = TunnelError::FrameTooLarge { size: 20, max: 16 };
        assert_eq!(err.to_string(), "Frame of 20 bytes exceeds limit of 16 bytes");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::other("test");
        let tunnel_err: TunnelError = io_err.into();
        assert!(matches!(tunnel_err, TunnelError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let tunnel_err: TunnelError = json_err.into();
        assert!(matches!(tunnel_err, TunnelError::Serialization(_)));
    }
}
