// src/io/error.rs
//
// Error types for the serial session engine.
// Transport, lifecycle and codec failures share one error type so the
// controller can classify them (surface vs. swallow during teardown).

use serde::Serialize;
use std::fmt;

// ============================================================================
// Codec Errors
// ============================================================================

/// Malformed user input rejected by the byte codec.
///
/// Codec errors are local to the caller of `encode()`: they never change
/// connection state and are never reported through session events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecError {
    /// The offending input token, when one can be named
    pub token: Option<String>,
    pub message: String,
}

impl CodecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            token: None,
            message: message.into(),
        }
    }

    pub fn token(token: &str, message: impl Into<String>) -> Self {
        Self {
            token: Some(token.to_string()),
            message: message.into(),
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.token {
            Some(token) => write!(f, "{}: '{}'", self.message, token),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CodecError {}

// ============================================================================
// IO Errors
// ============================================================================

/// Category of an IO error
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IoErrorKind {
    /// No serial transport exists on this platform
    Unsupported,
    /// No writer is held and none could be recovered
    NotConnected,
    /// The port is already open (another open is outstanding)
    AlreadyOpen,
    /// Operation on a port or stream that is already closed
    Closed,
    /// Stream is locked by another reader/writer
    Locked,
    /// Reader/writer lock was already released
    Released,
    /// Opening the port or acquiring its streams failed
    Connection,
    /// Read from the port failed
    Read,
    /// Write to the port failed
    Write,
    /// Operation exceeded the configured watchdog
    Timeout,
    /// Payload could not be encoded
    Codec(CodecError),
    /// Port enumeration or authorization failed
    Platform,
}

/// Error raised by transports and the session controller
#[derive(Clone, Debug)]
pub struct IoError {
    pub kind: IoErrorKind,
    /// Port (or subsystem) the error relates to
    pub device: String,
    pub message: String,
}

impl IoError {
    fn new(kind: IoErrorKind, device: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn unsupported() -> Self {
        Self::new(
            IoErrorKind::Unsupported,
            "serial",
            "Serial ports are not supported on this platform",
        )
    }

    pub fn not_connected() -> Self {
        Self::new(IoErrorKind::NotConnected, "serial", "Not connected")
    }

    pub fn already_open(device: &str) -> Self {
        Self::new(IoErrorKind::AlreadyOpen, device, "The port is already open")
    }

    pub fn closed(device: &str, message: impl Into<String>) -> Self {
        Self::new(IoErrorKind::Closed, device, message)
    }

    pub fn locked(device: &str, message: impl Into<String>) -> Self {
        Self::new(IoErrorKind::Locked, device, message)
    }

    pub fn released(device: &str, message: impl Into<String>) -> Self {
        Self::new(IoErrorKind::Released, device, message)
    }

    pub fn connection(device: &str, message: impl Into<String>) -> Self {
        Self::new(IoErrorKind::Connection, device, message)
    }

    pub fn read(device: &str, message: impl Into<String>) -> Self {
        Self::new(IoErrorKind::Read, device, message)
    }

    pub fn write(device: &str, message: impl Into<String>) -> Self {
        Self::new(IoErrorKind::Write, device, message)
    }

    pub fn timeout(device: &str, operation: &str) -> Self {
        Self::new(
            IoErrorKind::Timeout,
            device,
            format!("Timed out waiting for {}", operation),
        )
    }

    pub fn platform(message: impl Into<String>) -> Self {
        Self::new(IoErrorKind::Platform, "serial", message)
    }

    /// Failures that are an expected artifact of tearing down a connection:
    /// operating on something already closed, released or gone.
    ///
    /// Native errors only carry a message, so those are matched by text.
    pub fn is_teardown_expected(&self) -> bool {
        match self.kind {
            IoErrorKind::Closed | IoErrorKind::Locked | IoErrorKind::Released => true,
            IoErrorKind::Codec(_)
            | IoErrorKind::Unsupported
            | IoErrorKind::NotConnected
            | IoErrorKind::Timeout => false,
            _ => message_indicates_teardown(&self.message),
        }
    }

    /// Whether this error means the stream underneath is closed
    pub fn indicates_closed_stream(&self) -> bool {
        self.kind == IoErrorKind::Closed || message_indicates_closed(&self.message)
    }
}

fn message_indicates_closed(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["closed", "broken pipe", "no such device", "not connected"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn message_indicates_teardown(message: &str) -> bool {
    let lower = message.to_lowercase();
    message_indicates_closed(message)
        || ["locked", "released", "null"]
            .iter()
            .any(|needle| lower.contains(needle))
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            IoErrorKind::Codec(e) => write!(f, "{}", e),
            _ => write!(f, "{}: {}", self.device, self.message),
        }
    }
}

impl std::error::Error for IoError {}

impl From<CodecError> for IoError {
    fn from(e: CodecError) -> Self {
        let message = e.to_string();
        Self {
            kind: IoErrorKind::Codec(e),
            device: "codec".to_string(),
            message,
        }
    }
}

// ============================================================================
// Surfaced Error Reasons
// ============================================================================

/// Operation an error surfaced to the user belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    Unsupported,
    Connect,
    Disconnect,
    Send,
    Read,
    Registry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_classification_by_kind() {
        assert!(IoError::closed("COM1", "port closed").is_teardown_expected());
        assert!(IoError::locked("COM1", "reader locked").is_teardown_expected());
        assert!(IoError::released("COM1", "writer released").is_teardown_expected());
        assert!(!IoError::unsupported().is_teardown_expected());
        assert!(!IoError::timeout("COM1", "open").is_teardown_expected());
    }

    #[test]
    fn test_teardown_classification_by_message() {
        assert!(IoError::read("/dev/ttyUSB0", "Broken pipe (os error 32)").is_teardown_expected());
        assert!(IoError::write("/dev/ttyUSB0", "The stream is closed").is_teardown_expected());
        assert!(!IoError::read("/dev/ttyUSB0", "Framing error").is_teardown_expected());
    }

    #[test]
    fn test_codec_error_names_token() {
        let err: IoError = CodecError::token("256", "Decimal value out of range (0-255)").into();
        assert!(matches!(err.kind, IoErrorKind::Codec(_)));
        assert_eq!(err.to_string(), "Decimal value out of range (0-255): '256'");
        assert!(!err.is_teardown_expected());
    }

    #[test]
    fn test_closed_stream_detection() {
        assert!(IoError::write("COM3", "Failed to write: stream closed").indicates_closed_stream());
        assert!(!IoError::write("COM3", "Permission denied").indicates_closed_stream());
    }
}
