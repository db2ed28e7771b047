//! Error types for bridge operations
//!
//! The taxonomy mirrors how each failure is handled:
//!
//! - framing errors are recovered inside the frame decoder (resynchronise)
//! - transport errors are recovered by the owning connection manager
//!   (backoff and reconnect)
//! - configuration errors are fatal and only raised at startup
//!
//! Queue overflow is not an error: it is a counted policy decision reported
//! through [`crate::queue::PushOutcome`].

use thiserror::Error;

/// Recoverable error produced while turning serial bytes into frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// A line grew past the configured maximum frame length
    #[error("Frame overflow: {len} bytes exceeds maximum of {max} bytes")]
    FrameOverflow {
        /// Bytes buffered when the overflow was detected
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Raw packet bytes disagree with the length announced by the firmware
    #[error("Length mismatch: firmware announced {announced} bytes, got {actual}")]
    LengthMismatch {
        /// Length from the `len=` field
        announced: usize,
        /// Length of the preceding raw hex line
        actual: usize,
    },

    /// Line looked like a frame but could not be parsed
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Framing Errors =====
    /// Serial framing error
    #[error(transparent)]
    Framing(#[from] FramingError),

    // ===== Serial Transport Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// Serial read error
    #[error("Serial read error: {0}")]
    ReadError(String),

    /// Serial write error
    #[error("Serial write error: {0}")]
    WriteError(String),

    /// Serial port disconnected
    #[error("Serial port disconnected")]
    Disconnected,

    /// Device did not answer a CLI query usefully
    #[error("Device query failed: {0}")]
    DeviceQueryFailed(String),

    // ===== Broker Transport Errors =====
    /// Broker connection could not be established
    #[error("Broker connection failed: {0}")]
    BrokerConnect(String),

    /// Broker session was lost
    #[error("Broker connection lost: {0}")]
    BrokerDisconnected(String),

    /// Broker refused or failed a publish
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed {
        /// Destination topic
        topic: String,
        /// Failure reason
        reason: String,
    },

    /// Publish was not acknowledged in time
    #[error("Publish acknowledgement timeout after {duration_ms}ms")]
    AckTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Broker did not accept the session in time
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    /// Configuration key this bridge does not understand
    #[error("Unrecognized configuration key: {0}")]
    UnknownConfigKey(String),

    // ===== General Errors =====
    /// Payload encoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Check if this error is recovered by reconnecting a transport
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BridgeError::PortNotFound(_)
                | BridgeError::PortOpenFailed { .. }
                | BridgeError::ReadError(_)
                | BridgeError::WriteError(_)
                | BridgeError::Disconnected
                | BridgeError::DeviceQueryFailed(_)
                | BridgeError::BrokerConnect(_)
                | BridgeError::BrokerDisconnected(_)
                | BridgeError::PublishFailed { .. }
                | BridgeError::AckTimeout { .. }
                | BridgeError::ConnectionTimeout { .. }
                | BridgeError::Io(_)
        )
    }

    /// Check if this is a framing error (bad data from device)
    pub fn is_framing_error(&self) -> bool {
        matches!(self, BridgeError::Framing(_))
    }

    /// Check if this error must terminate the process
    ///
    /// Only configuration errors qualify, and they are only raised before
    /// any transport is opened.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidConfig(_)
                | BridgeError::MissingConfig(_)
                | BridgeError::UnknownConfigKey(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::Framing(FramingError::FrameOverflow { .. }) => "FRAME_OVERFLOW",
            BridgeError::Framing(FramingError::LengthMismatch { .. }) => "LENGTH_MISMATCH",
            BridgeError::Framing(FramingError::Malformed(_)) => "MALFORMED_FRAME",
            BridgeError::PortNotFound(_) => "PORT_NOT_FOUND",
            BridgeError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            BridgeError::ReadError(_) => "READ_ERROR",
            BridgeError::WriteError(_) => "WRITE_ERROR",
            BridgeError::Disconnected => "DISCONNECTED",
            BridgeError::DeviceQueryFailed(_) => "DEVICE_QUERY_FAILED",
            BridgeError::BrokerConnect(_) => "BROKER_CONNECT",
            BridgeError::BrokerDisconnected(_) => "BROKER_DISCONNECTED",
            BridgeError::PublishFailed { .. } => "PUBLISH_FAILED",
            BridgeError::AckTimeout { .. } => "ACK_TIMEOUT",
            BridgeError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::MissingConfig(_) => "MISSING_CONFIG",
            BridgeError::UnknownConfigKey(_) => "UNKNOWN_CONFIG_KEY",
            BridgeError::Serialization(_) => "SERIALIZATION_ERROR",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<tokio_serial::Error> for BridgeError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind {
            tokio_serial::ErrorKind::NoDevice => BridgeError::PortNotFound(err.description),
            tokio_serial::ErrorKind::Io(kind) => {
                BridgeError::Io(std::io::Error::new(kind, err.description))
            }
            _ => BridgeError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

impl From<rumqttc::ClientError> for BridgeError {
    fn from(err: rumqttc::ClientError) -> Self {
        BridgeError::BrokerDisconnected(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for BridgeError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        BridgeError::BrokerDisconnected(err.to_string())
    }
}
