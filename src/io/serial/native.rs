// src/io/serial/native.rs
//
// OS serial ports via the serialport crate.
//
// serialport is blocking, so every open/read/write runs on the blocking pool.
// Reads use a short port timeout and poll a cancel flag between attempts,
// which is how a pending read is cancelled.
//
// The OS handle sits in an Option behind the shared port mutex. Closing takes
// it out under that mutex, so the device is released once close() returns
// even while a cancelled read is still winding down on the blocking pool.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::Serialize;
use serialport::{SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::io::transport::{
    PortHandle, PortIdentity, PortReader, PortWriter, SerialTransport, StreamState,
};
use crate::io::IoError;

/// Port read timeout; bounds how long a cancelled read keeps running
const READ_POLL: Duration = Duration::from_millis(50);
const READ_BUFFER: usize = 1024;

/// Whether the OS exposes serial ports at all. Checked once.
static SERIAL_SUPPORTED: Lazy<bool> = Lazy::new(|| match serialport::available_ports() {
    Ok(_) => true,
    Err(e) => {
        tlog!("[serial] Port enumeration unavailable: {}", e);
        false
    }
});

pub fn is_supported() -> bool {
    *SERIAL_SUPPORTED
}

// ============================================================================
// Port Enumeration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    pub fn identity(&self) -> PortIdentity {
        PortIdentity {
            vendor_id: self.vid,
            product_id: self.pid,
        }
    }
}

/// List available serial ports
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices.
/// The tty devices block on open waiting for carrier detect.
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, IoError> {
    let ports = serialport::available_ports()
        .map_err(|e| IoError::platform(format!("Failed to enumerate ports: {}", e)))?;

    Ok(ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                SerialPortType::UsbPort(info) => (
                    "USB".to_string(),
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                SerialPortType::BluetoothPort => {
                    ("Bluetooth".to_string(), None, None, None, None, None)
                }
                SerialPortType::PciPort => ("PCI".to_string(), None, None, None, None, None),
                SerialPortType::Unknown => ("Unknown".to_string(), None, None, None, None, None),
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}

// ============================================================================
// Transport
// ============================================================================

/// Lets the user pick one of the available ports. Stands in for the
/// permission prompt: only ports picked here (or authorized up front) are
/// ever opened.
pub trait PortPrompt: Send + Sync {
    /// Index into `ports`, or None if the user cancelled
    fn choose(&self, ports: &[SerialPortInfo]) -> Option<usize>;
}

pub struct NativeTransport {
    authorized: Mutex<Vec<Arc<NativePort>>>,
    prompt: Option<Arc<dyn PortPrompt>>,
}

impl NativeTransport {
    pub fn new(prompt: Option<Arc<dyn PortPrompt>>) -> Self {
        Self {
            authorized: Mutex::new(Vec::new()),
            prompt,
        }
    }

    /// The native transport, if this machine has serial support
    pub fn detect(prompt: Option<Arc<dyn PortPrompt>>) -> Option<Arc<NativeTransport>> {
        if is_supported() {
            Some(Arc::new(Self::new(prompt)))
        } else {
            None
        }
    }

    /// Authorize a port by path without prompting
    pub fn authorize(&self, port_name: &str) -> Result<(), IoError> {
        let info = list_serial_ports()?
            .into_iter()
            .find(|p| p.port_name == port_name)
            .unwrap_or_else(|| SerialPortInfo {
                // Ports that don't enumerate (e.g. pseudo terminals) can still be opened
                port_name: port_name.to_string(),
                port_type: "Unknown".to_string(),
                manufacturer: None,
                product: None,
                serial_number: None,
                vid: None,
                pid: None,
            });
        self.insert(info);
        Ok(())
    }

    fn insert(&self, info: SerialPortInfo) -> Arc<NativePort> {
        let mut authorized = lock(&self.authorized);
        if let Some(existing) = authorized.iter().find(|p| p.info.port_name == info.port_name) {
            return existing.clone();
        }
        let port = Arc::new(NativePort::new(info));
        authorized.push(port.clone());
        port
    }
}

#[async_trait]
impl SerialTransport for NativeTransport {
    async fn list_authorized_ports(&self) -> Result<Vec<Arc<dyn PortHandle>>, IoError> {
        Ok(lock(&self.authorized)
            .iter()
            .map(|p| p.clone() as Arc<dyn PortHandle>)
            .collect())
    }

    async fn request_port(&self) -> Result<Option<Arc<dyn PortHandle>>, IoError> {
        let prompt = self
            .prompt
            .clone()
            .ok_or_else(|| IoError::platform("No port chooser available"))?;

        let ports = tokio::task::spawn_blocking(list_serial_ports)
            .await
            .map_err(|e| IoError::platform(format!("Port enumeration task failed: {}", e)))??;

        let (choice, ports) = tokio::task::spawn_blocking(move || {
            let choice = prompt.choose(&ports);
            (choice, ports)
        })
        .await
        .map_err(|e| IoError::platform(format!("Port chooser failed: {}", e)))?;

        match choice.and_then(|i| ports.into_iter().nth(i)) {
            Some(info) => Ok(Some(self.insert(info) as Arc<dyn PortHandle>)),
            None => Ok(None),
        }
    }
}

// ============================================================================
// Port
// ============================================================================

/// Taken (set to None) on close
type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

#[derive(Default)]
struct NativeState {
    port: Option<SharedPort>,
    reader: Option<u64>,
    writer: Option<u64>,
    next_lock_id: u64,
    /// Device stopped responding (unplugged, I/O error)
    lost: bool,
}

impl NativeState {
    fn stream_state(&self, holder: Option<u64>) -> StreamState {
        if self.port.is_none() || self.lost {
            StreamState::Unavailable
        } else {
            StreamState::Available {
                locked: holder.is_some(),
            }
        }
    }
}

struct NativeShared {
    name: String,
    state: Mutex<NativeState>,
}

impl NativeShared {
    fn state(&self) -> MutexGuard<'_, NativeState> {
        lock(&self.state)
    }

    fn mark_lost(&self) {
        self.state().lost = true;
    }
}

pub struct NativePort {
    info: SerialPortInfo,
    shared: Arc<NativeShared>,
}

impl NativePort {
    fn new(info: SerialPortInfo) -> Self {
        let shared = Arc::new(NativeShared {
            name: info.port_name.clone(),
            state: Mutex::new(NativeState::default()),
        });
        Self { info, shared }
    }

    pub fn info(&self) -> &SerialPortInfo {
        &self.info
    }
}

#[async_trait]
impl PortHandle for NativePort {
    fn identity(&self) -> PortIdentity {
        self.info.identity()
    }

    fn label(&self) -> String {
        match &self.info.product {
            Some(product) => format!("{} - {}", self.info.port_name, product),
            None => self.info.port_name.clone(),
        }
    }

    async fn open(&self, baud_rate: u32) -> Result<(), IoError> {
        if self.shared.state().port.is_some() {
            return Err(IoError::already_open(&self.shared.name));
        }

        let name = self.shared.name.clone();
        let opened = tokio::task::spawn_blocking(move || {
            serialport::new(&name, baud_rate).timeout(READ_POLL).open()
        })
        .await
        .map_err(|e| IoError::connection(&self.shared.name, format!("Open task failed: {}", e)))?
        .map_err(|e| {
            IoError::connection(
                &self.shared.name,
                format!("Failed to open {}: {}", self.shared.name, e),
            )
        })?;

        let mut state = self.shared.state();
        if state.port.is_some() {
            return Err(IoError::already_open(&self.shared.name));
        }
        state.port = Some(Arc::new(Mutex::new(Some(opened))));
        state.lost = false;
        tlog!("[serial:{}] Opened at {} baud", self.shared.name, baud_rate);
        Ok(())
    }

    async fn close(&self) -> Result<(), IoError> {
        let port = {
            let mut state = self.shared.state();
            if state.port.is_none() {
                return Err(IoError::closed(&self.shared.name, "The port is already closed"));
            }
            if state.reader.is_some() || state.writer.is_some() {
                return Err(IoError::locked(
                    &self.shared.name,
                    "Cannot close a port while a stream is locked",
                ));
            }
            state.lost = false;
            state.port.take()
        };

        // Waits out an in-flight read poll or write, then drops the OS handle
        if let Some(port) = port {
            tokio::task::spawn_blocking(move || {
                lock(&port).take();
            })
            .await
            .map_err(|e| {
                IoError::platform(format!("Close task for {} failed: {}", self.shared.name, e))
            })?;
        }
        tlog!("[serial:{}] Closed", self.shared.name);
        Ok(())
    }

    fn reader(&self) -> Result<Option<Arc<dyn PortReader>>, IoError> {
        let mut state = self.shared.state();
        let port = match (&state.port, state.lost) {
            (Some(port), false) => port.clone(),
            _ => return Ok(None),
        };
        if state.reader.is_some() {
            return Err(IoError::locked(&self.shared.name, "Readable stream is locked"));
        }
        state.next_lock_id += 1;
        state.reader = Some(state.next_lock_id);
        Ok(Some(Arc::new(NativeReader {
            shared: self.shared.clone(),
            id: state.next_lock_id,
            port,
            cancelled: Arc::new(AtomicBool::new(false)),
        })))
    }

    fn writer(&self) -> Result<Option<Arc<dyn PortWriter>>, IoError> {
        let mut state = self.shared.state();
        let port = match (&state.port, state.lost) {
            (Some(port), false) => port.clone(),
            _ => return Ok(None),
        };
        if state.writer.is_some() {
            return Err(IoError::locked(&self.shared.name, "Writable stream is locked"));
        }
        state.next_lock_id += 1;
        state.writer = Some(state.next_lock_id);
        Ok(Some(Arc::new(NativeWriter {
            shared: self.shared.clone(),
            id: state.next_lock_id,
            port,
        })))
    }

    fn readable(&self) -> StreamState {
        let state = self.shared.state();
        state.stream_state(state.reader)
    }

    fn writable(&self) -> StreamState {
        let state = self.shared.state();
        state.stream_state(state.writer)
    }
}

// ============================================================================
// Reader / Writer
// ============================================================================

struct NativeReader {
    shared: Arc<NativeShared>,
    id: u64,
    port: SharedPort,
    cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl PortReader for NativeReader {
    async fn read(&self) -> Result<Option<Vec<u8>>, IoError> {
        if self.shared.state().reader != Some(self.id) {
            return Err(IoError::released(&self.shared.name, "Reader lock was released"));
        }

        let port = self.port.clone();
        let cancelled = self.cancelled.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER];
            while !cancelled.load(Ordering::SeqCst) {
                let read = match lock(&port).as_mut() {
                    Some(port) => port.read(&mut buf),
                    // Closed underneath us
                    None => return Ok(None),
                };
                match read {
                    Ok(0) => return Ok(None),
                    Ok(n) => return Ok(Some(buf[..n].to_vec())),
                    Err(ref e) if e.kind() == ErrorKind::TimedOut => {}
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => return Err(format!("Read error: {}", e)),
                }
            }
            Ok(None)
        })
        .await
        .map_err(|e| IoError::read(&self.shared.name, format!("Read task failed: {}", e)))?;

        match result {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                let closed = self.shared.state().port.is_none();
                if !self.cancelled.load(Ordering::SeqCst) && !closed {
                    // EOF from the driver means the device went away
                    self.shared.mark_lost();
                }
                Ok(None)
            }
            Err(message) => {
                self.shared.mark_lost();
                Err(IoError::read(&self.shared.name, message))
            }
        }
    }

    async fn cancel(&self) -> Result<(), IoError> {
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn release_lock(&self) -> Result<(), IoError> {
        let mut state = self.shared.state();
        if state.reader != Some(self.id) {
            return Err(IoError::released(&self.shared.name, "Reader lock already released"));
        }
        state.reader = None;
        Ok(())
    }
}

struct NativeWriter {
    shared: Arc<NativeShared>,
    id: u64,
    port: SharedPort,
}

#[async_trait]
impl PortWriter for NativeWriter {
    async fn write(&self, bytes: &[u8]) -> Result<(), IoError> {
        {
            let state = self.shared.state();
            if state.writer != Some(self.id) {
                return Err(IoError::released(&self.shared.name, "Writer lock was released"));
            }
            if state.lost {
                return Err(IoError::closed(&self.shared.name, "The stream is closed"));
            }
        }

        let port = self.port.clone();
        let data = bytes.to_vec();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = lock(&port);
            match guard.as_mut() {
                Some(port) => port.write_all(&data).and_then(|_| port.flush()),
                None => Err(std::io::Error::new(ErrorKind::NotConnected, "Port is closed")),
            }
        })
        .await
        .map_err(|e| IoError::write(&self.shared.name, format!("Write task failed: {}", e)))?;

        result.map_err(|e| match e.kind() {
            ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::UnexpectedEof => {
                self.shared.mark_lost();
                IoError::closed(&self.shared.name, format!("Write error: {}", e))
            }
            _ => IoError::write(&self.shared.name, format!("Write error: {}", e)),
        })
    }

    fn release_lock(&self) -> Result<(), IoError> {
        let mut state = self.shared.state();
        if state.writer != Some(self.id) {
            return Err(IoError::released(&self.shared.name, "Writer lock already released"));
        }
        state.writer = None;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, vid: Option<u16>, pid: Option<u16>) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: "USB".to_string(),
            manufacturer: None,
            product: Some("CP2102".to_string()),
            serial_number: None,
            vid,
            pid,
        }
    }

    #[test]
    fn test_identity_from_info() {
        let port = NativePort::new(info("/dev/ttyUSB0", Some(0x10c4), Some(0xea60)));
        assert_eq!(port.identity(), PortIdentity::usb(0x10c4, 0xea60));
        assert_eq!(port.label(), "/dev/ttyUSB0 - CP2102");
    }

    #[tokio::test]
    async fn test_unopened_port_has_no_streams() {
        let port = NativePort::new(info("/dev/ttyUSB9", None, None));
        assert_eq!(port.readable(), StreamState::Unavailable);
        assert_eq!(port.writable(), StreamState::Unavailable);
        assert!(port.reader().unwrap().is_none());
        assert!(port.writer().unwrap().is_none());

        let err = port.close().await.unwrap_err();
        assert!(err.is_teardown_expected());
    }

    #[tokio::test]
    async fn test_open_missing_device_fails() {
        let port = NativePort::new(info("/dev/serialdeck-missing", None, None));
        let err = port.open(9600).await.unwrap_err();
        assert_eq!(err.kind, crate::io::IoErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_request_without_prompt_fails() {
        let transport = NativeTransport::new(None);
        assert!(transport.request_port().await.is_err());
    }

    /// Pseudo terminal that enumeration doesn't list. The master end stays
    /// alive for as long as the returned handle does.
    #[cfg(target_os = "linux")]
    fn pty() -> (serialport::TTYPort, String) {
        let (master, slave) = serialport::TTYPort::pair().unwrap();
        let name = slave.name().unwrap();
        drop(slave);
        (master, name)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_close_releases_device_during_read() {
        let (_master, name) = pty();
        let transport = NativeTransport::new(None);
        transport.authorize(&name).unwrap();
        let port = transport.list_authorized_ports().await.unwrap().remove(0);

        port.open(9600).await.unwrap();
        let reader = port.reader().unwrap().unwrap();
        let pending = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.read().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        reader.cancel().await.unwrap();
        reader.release_lock().unwrap();
        port.close().await.unwrap();

        // Exclusive lock on the device must be gone already
        port.open(9600).await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), None);
        assert_eq!(port.readable(), StreamState::Available { locked: false });
        port.close().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_session_reconnects_to_same_pty() {
        use crate::io::{ConnectionConfig, SessionController, SessionOptions, SessionPhase};

        let (_master, name) = pty();
        let transport = Arc::new(NativeTransport::new(None));
        transport.authorize(&name).unwrap();
        let (controller, _rx) = SessionController::new(
            Some(transport as Arc<dyn SerialTransport>),
            ConnectionConfig::default(),
            SessionOptions::default(),
        );
        let target = controller.list_ports().await.unwrap().remove(0);

        controller.connect(9600, Some(target.clone())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Reconnect without disconnect
        controller.connect(9600, Some(target.clone())).await.unwrap();
        assert_eq!(controller.status().await.phase, SessionPhase::Connected);

        controller.disconnect().await.unwrap();
        controller.connect(9600, Some(target)).await.unwrap();
        assert_eq!(controller.status().await.phase, SessionPhase::Connected);
        controller.disconnect().await.unwrap();
    }

    #[test]
    fn test_authorize_is_deduplicated() {
        let transport = NativeTransport::new(None);
        let a = transport.insert(info("/dev/ttyACM0", None, None));
        let b = transport.insert(info("/dev/ttyACM0", None, None));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(lock(&transport.authorized).len(), 1);
    }
}
