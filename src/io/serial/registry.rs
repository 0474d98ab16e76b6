// src/io/serial/registry.rs
//
// Enumeration and authorization of serial ports.
// Wraps each transport port handle in a descriptor with a stable id and
// display name, and re-selects a previously used device by USB identity.

use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::io::transport::{PortHandle, PortIdentity, SerialTransport};
use crate::io::IoError;

// ============================================================================
// Port Descriptor
// ============================================================================

/// A port the user has authorized
#[derive(Clone)]
pub struct PortDescriptor {
    /// `usb-<vid>-<pid>` (lowercase hex, 4 digits) or `port-<random>`
    pub id: String,
    /// Display name, e.g. "USB Serial (2341:0043)"
    pub name: String,
    pub identity: PortIdentity,
    pub handle: Arc<dyn PortHandle>,
}

impl PortDescriptor {
    pub fn from_handle(handle: Arc<dyn PortHandle>) -> Self {
        let identity = handle.identity();
        Self {
            id: port_id(&identity),
            name: display_name(&handle.label(), &identity),
            identity,
            handle,
        }
    }

    /// True when both descriptors wrap the same port handle
    pub fn same_port(&self, other: &PortDescriptor) -> bool {
        Arc::as_ptr(&self.handle) as *const () == Arc::as_ptr(&other.handle) as *const ()
    }
}

impl fmt::Debug for PortDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("identity", &self.identity)
            .finish()
    }
}

/// Stable id for a port. Ports without a USB identity get a random id,
/// so they cannot be re-identified across enumerations.
pub fn port_id(identity: &PortIdentity) -> String {
    match identity.pair() {
        Some((vid, pid)) => format!("usb-{:04x}-{:04x}", vid, pid),
        None => format!("port-{}", Uuid::new_v4().simple()),
    }
}

fn display_name(label: &str, identity: &PortIdentity) -> String {
    let base = if label.trim().is_empty() {
        "Serial Port"
    } else {
        label.trim()
    };
    match identity.pair() {
        Some((vid, pid)) => format!("{} ({:04x}:{:04x})", base, vid, pid),
        None => base.to_string(),
    }
}

// ============================================================================
// Registry
// ============================================================================

pub struct PortRegistry {
    transport: Arc<dyn SerialTransport>,
}

impl PortRegistry {
    pub fn new(transport: Arc<dyn SerialTransport>) -> Self {
        Self { transport }
    }

    /// Ports already authorized, in transport order
    pub async fn list_authorized(&self) -> Result<Vec<PortDescriptor>, IoError> {
        let handles = self.transport.list_authorized_ports().await.map_err(|e| {
            tlog!("[registry] Failed to enumerate ports: {}", e);
            e
        })?;
        Ok(handles.into_iter().map(PortDescriptor::from_handle).collect())
    }

    /// Prompt the user to authorize a port. `Ok(None)` when they cancel.
    pub async fn request_new(&self) -> Result<Option<PortDescriptor>, IoError> {
        match self.transport.request_port().await {
            Ok(Some(handle)) => {
                let descriptor = PortDescriptor::from_handle(handle);
                tlog!(
                    "[registry] Authorized {} ({})",
                    descriptor.name,
                    descriptor.id
                );
                Ok(Some(descriptor))
            }
            Ok(None) => {
                tlog!("[registry] Port selection cancelled");
                Ok(None)
            }
            Err(e) => {
                tlog!("[registry] Port request failed: {}", e);
                Err(e)
            }
        }
    }

    /// First port whose USB identity matches. Ports without an identity
    /// never match.
    pub fn find_matching<'a>(
        ports: &'a [PortDescriptor],
        identity: &PortIdentity,
    ) -> Option<&'a PortDescriptor> {
        let wanted = identity.pair()?;
        ports.iter().find(|p| p.identity.pair() == Some(wanted))
    }
}
