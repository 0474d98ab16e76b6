// src/io/transport.rs
//
// Capability interface the session engine requires from a serial transport.
// A transport is either present or not (checked once when the controller is
// built); call sites never test for individual capabilities.
//
// Implementations:
// - serial/native.rs    - OS serial ports via the serialport crate
// - serial/simulated.rs - in-memory ports for tests and loopback use

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::IoError;

// ============================================================================
// Types
// ============================================================================

/// USB identity reported by a port, when it has one
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortIdentity {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl PortIdentity {
    pub fn usb(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
        }
    }

    /// Both identifiers, if both are present
    pub fn pair(&self) -> Option<(u16, u16)> {
        match (self.vendor_id, self.product_id) {
            (Some(v), Some(p)) => Some((v, p)),
            _ => None,
        }
    }
}

/// Availability of one direction of a port's byte stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// No stream (port closed or device gone)
    Unavailable,
    /// Stream exists; `locked` when a reader/writer currently holds it
    Available { locked: bool },
}

impl StreamState {
    pub fn is_available(&self) -> bool {
        matches!(self, StreamState::Available { .. })
    }
}

// ============================================================================
// Capability Traits
// ============================================================================

/// Entry point: enumeration and authorization of ports
#[async_trait]
pub trait SerialTransport: Send + Sync {
    /// Ports the user has already authorized
    async fn list_authorized_ports(&self) -> Result<Vec<Arc<dyn PortHandle>>, IoError>;

    /// Ask the user to authorize a port. `Ok(None)` means the user cancelled.
    async fn request_port(&self) -> Result<Option<Arc<dyn PortHandle>>, IoError>;
}

/// One physical port
#[async_trait]
pub trait PortHandle: Send + Sync {
    fn identity(&self) -> PortIdentity;

    /// Human-readable label
    fn label(&self) -> String;

    /// Open at the given baud rate. Fails with `IoErrorKind::AlreadyOpen`
    /// when the port is already open.
    async fn open(&self, baud_rate: u32) -> Result<(), IoError>;

    async fn close(&self) -> Result<(), IoError>;

    /// Acquire the exclusive reader. `Ok(None)` when the readable stream is
    /// unavailable; `Err` (Locked) when another reader holds it.
    fn reader(&self) -> Result<Option<Arc<dyn PortReader>>, IoError>;

    /// Acquire the exclusive writer, with the same contract as `reader()`
    fn writer(&self) -> Result<Option<Arc<dyn PortWriter>>, IoError>;

    fn readable(&self) -> StreamState;

    fn writable(&self) -> StreamState;
}

/// Exclusive reading end of a port
#[async_trait]
pub trait PortReader: Send + Sync {
    /// Next chunk of bytes, or `Ok(None)` once the stream is done
    /// (end of stream or cancelled).
    async fn read(&self) -> Result<Option<Vec<u8>>, IoError>;

    /// Cancel the stream; a pending `read()` resolves promptly with `None`
    async fn cancel(&self) -> Result<(), IoError>;

    fn release_lock(&self) -> Result<(), IoError>;
}

/// Exclusive writing end of a port
#[async_trait]
pub trait PortWriter: Send + Sync {
    async fn write(&self, bytes: &[u8]) -> Result<(), IoError>;

    fn release_lock(&self) -> Result<(), IoError>;
}
