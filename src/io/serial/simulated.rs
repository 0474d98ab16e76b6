// src/io/serial/simulated.rs
//
// In-memory serial transport for tests and loopback use.
// Ports honour the same exclusivity rules as real ones: one reader and one
// writer lock at a time, close refused while a stream is locked, reads that
// park until data arrives or the reader is cancelled.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::io::transport::{
    PortHandle, PortIdentity, PortReader, PortWriter, SerialTransport, StreamState,
};
use crate::io::IoError;

// ============================================================================
// Transport
// ============================================================================

/// What the next authorization prompt does
pub enum RequestOutcome {
    Select(Arc<SimulatedPort>),
    /// Select the port once the notify fires; the prompt stays open until then
    Hold(Arc<Notify>, Arc<SimulatedPort>),
    Cancel,
    Fail(String),
}

pub struct SimulatedTransport {
    ports: Mutex<Vec<Arc<SimulatedPort>>>,
    requests: Mutex<VecDeque<RequestOutcome>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::with_ports(Vec::new())
    }

    /// Transport whose given ports are already authorized
    pub fn with_ports(ports: Vec<Arc<SimulatedPort>>) -> Self {
        Self {
            ports: Mutex::new(ports),
            requests: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue the outcome of the next `request_port()` call.
    /// With nothing queued the prompt behaves as if the user cancelled.
    pub fn queue_request(&self, outcome: RequestOutcome) {
        lock(&self.requests).push_back(outcome);
    }

    fn authorize(&self, port: Arc<SimulatedPort>) -> Arc<dyn PortHandle> {
        let mut ports = lock(&self.ports);
        if !ports.iter().any(|p| Arc::ptr_eq(p, &port)) {
            ports.push(port.clone());
        }
        port
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SerialTransport for SimulatedTransport {
    async fn list_authorized_ports(&self) -> Result<Vec<Arc<dyn PortHandle>>, IoError> {
        Ok(lock(&self.ports)
            .iter()
            .map(|p| p.clone() as Arc<dyn PortHandle>)
            .collect())
    }

    async fn request_port(&self) -> Result<Option<Arc<dyn PortHandle>>, IoError> {
        let outcome = lock(&self.requests).pop_front();
        match outcome {
            Some(RequestOutcome::Select(port)) => Ok(Some(self.authorize(port))),
            Some(RequestOutcome::Hold(release, port)) => {
                release.notified().await;
                Ok(Some(self.authorize(port)))
            }
            Some(RequestOutcome::Fail(message)) => Err(IoError::platform(message)),
            Some(RequestOutcome::Cancel) | None => Ok(None),
        }
    }
}

// ============================================================================
// Port
// ============================================================================

#[derive(Default)]
struct PortState {
    open: bool,
    unplugged: bool,
    /// Readable side gone while the port stays writable
    read_side_lost: bool,
    baud_rate: Option<u32>,
    /// Lock ids of the current reader/writer holders
    reader: Option<u64>,
    writer: Option<u64>,
    next_lock_id: u64,
    rx: VecDeque<Vec<u8>>,
    eof_pending: bool,
    written: Vec<u8>,
    writes: Vec<Vec<u8>>,
    open_calls: usize,
    reader_acquisitions: usize,
    fail_open: VecDeque<IoError>,
    fail_reader: bool,
    fail_read: Option<IoError>,
    fail_close: Option<IoError>,
    fail_write: Option<IoError>,
    stall_writes: bool,
}

struct PortInner {
    name: String,
    state: Mutex<PortState>,
    notify: Notify,
    echo: bool,
}

impl PortInner {
    fn state(&self) -> MutexGuard<'_, PortState> {
        lock(&self.state)
    }
}

/// In-memory serial port
pub struct SimulatedPort {
    identity: PortIdentity,
    inner: Arc<PortInner>,
}

impl SimulatedPort {
    pub fn new(name: &str, identity: PortIdentity) -> Arc<Self> {
        Self::build(name, identity, false)
    }

    /// Port that echoes every write back to its reader
    pub fn loopback(name: &str) -> Arc<Self> {
        Self::build(name, PortIdentity::default(), true)
    }

    fn build(name: &str, identity: PortIdentity, echo: bool) -> Arc<Self> {
        Arc::new(Self {
            identity,
            inner: Arc::new(PortInner {
                name: name.to_string(),
                state: Mutex::new(PortState::default()),
                notify: Notify::new(),
                echo,
            }),
        })
    }

    /// Deliver a chunk to the reader
    pub fn inject(&self, bytes: &[u8]) {
        self.inner.state().rx.push_back(bytes.to_vec());
        self.inner.notify.notify_waiters();
    }

    /// End the current read stream while the port stays open
    pub fn inject_eof(&self) {
        self.inner.state().eof_pending = true;
        self.inner.notify.notify_waiters();
    }

    /// Device disappears: both streams become unavailable
    pub fn unplug(&self) {
        self.inner.state().unplugged = true;
        self.inner.notify.notify_waiters();
    }

    /// Mark the port open behind the session's back
    pub fn force_open(&self) {
        self.inner.state().open = true;
    }

    pub fn fail_next_open(&self, error: IoError) {
        self.inner.state().fail_open.push_back(error);
    }

    pub fn fail_reader(&self, fail: bool) {
        self.inner.state().fail_reader = fail;
    }

    /// Only the readable stream goes away
    pub fn lose_read_side(&self) {
        self.inner.state().read_side_lost = true;
        self.inner.notify.notify_waiters();
    }

    pub fn fail_next_read(&self, error: IoError) {
        self.inner.state().fail_read = Some(error);
        self.inner.notify.notify_waiters();
    }

    pub fn fail_next_close(&self, error: IoError) {
        self.inner.state().fail_close = Some(error);
    }

    pub fn fail_next_write(&self, error: IoError) {
        self.inner.state().fail_write = Some(error);
    }

    /// Writes never complete while set
    pub fn stall_writes(&self, stall: bool) {
        self.inner.state().stall_writes = stall;
    }

    pub fn written(&self) -> Vec<u8> {
        self.inner.state().written.clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.state().writes.clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state().open
    }

    pub fn baud_rate(&self) -> Option<u32> {
        self.inner.state().baud_rate
    }

    pub fn open_calls(&self) -> usize {
        self.inner.state().open_calls
    }

    pub fn reader_held(&self) -> bool {
        self.inner.state().reader.is_some()
    }

    pub fn writer_held(&self) -> bool {
        self.inner.state().writer.is_some()
    }

    pub fn reader_acquisitions(&self) -> usize {
        self.inner.state().reader_acquisitions
    }
}

#[async_trait]
impl PortHandle for SimulatedPort {
    fn identity(&self) -> PortIdentity {
        self.identity
    }

    fn label(&self) -> String {
        self.inner.name.clone()
    }

    async fn open(&self, baud_rate: u32) -> Result<(), IoError> {
        let mut st = self.inner.state();
        st.open_calls += 1;
        if let Some(e) = st.fail_open.pop_front() {
            return Err(e);
        }
        if st.unplugged {
            return Err(IoError::connection(&self.inner.name, "Device not found"));
        }
        if st.open {
            return Err(IoError::already_open(&self.inner.name));
        }
        st.open = true;
        st.baud_rate = Some(baud_rate);
        st.eof_pending = false;
        st.read_side_lost = false;
        Ok(())
    }

    async fn close(&self) -> Result<(), IoError> {
        {
            let mut st = self.inner.state();
            if !st.open {
                return Err(IoError::closed(&self.inner.name, "The port is already closed"));
            }
            if let Some(e) = st.fail_close.take() {
                return Err(e);
            }
            if st.reader.is_some() || st.writer.is_some() {
                return Err(IoError::locked(
                    &self.inner.name,
                    "Cannot close a port while a stream is locked",
                ));
            }
            st.open = false;
            st.rx.clear();
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    fn reader(&self) -> Result<Option<Arc<dyn PortReader>>, IoError> {
        let mut st = self.inner.state();
        if !st.open || st.unplugged || st.read_side_lost {
            return Ok(None);
        }
        if st.fail_reader {
            return Err(IoError::connection(&self.inner.name, "Failed to get reader"));
        }
        if st.reader.is_some() {
            return Err(IoError::locked(&self.inner.name, "Readable stream is locked"));
        }
        st.next_lock_id += 1;
        let id = st.next_lock_id;
        st.reader = Some(id);
        st.reader_acquisitions += 1;
        Ok(Some(Arc::new(SimulatedReader {
            inner: self.inner.clone(),
            id,
            cancelled: AtomicBool::new(false),
        })))
    }

    fn writer(&self) -> Result<Option<Arc<dyn PortWriter>>, IoError> {
        let mut st = self.inner.state();
        if !st.open || st.unplugged {
            return Ok(None);
        }
        if st.writer.is_some() {
            return Err(IoError::locked(&self.inner.name, "Writable stream is locked"));
        }
        st.next_lock_id += 1;
        let id = st.next_lock_id;
        st.writer = Some(id);
        Ok(Some(Arc::new(SimulatedWriter {
            inner: self.inner.clone(),
            id,
        })))
    }

    fn readable(&self) -> StreamState {
        let st = self.inner.state();
        if !st.open || st.unplugged || st.read_side_lost {
            StreamState::Unavailable
        } else {
            StreamState::Available {
                locked: st.reader.is_some(),
            }
        }
    }

    fn writable(&self) -> StreamState {
        let st = self.inner.state();
        if !st.open || st.unplugged {
            StreamState::Unavailable
        } else {
            StreamState::Available {
                locked: st.writer.is_some(),
            }
        }
    }
}

// ============================================================================
// Reader / Writer
// ============================================================================

struct SimulatedReader {
    inner: Arc<PortInner>,
    id: u64,
    cancelled: AtomicBool,
}

#[async_trait]
impl PortReader for SimulatedReader {
    async fn read(&self) -> Result<Option<Vec<u8>>, IoError> {
        loop {
            // Register interest before checking state so a wake-up between
            // the check and the await is not lost
            let notified = self.inner.notify.notified();
            {
                let mut st = self.inner.state();
                if self.cancelled.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                if st.reader != Some(self.id) {
                    return Err(IoError::released(&self.inner.name, "Reader lock was released"));
                }
                if let Some(e) = st.fail_read.take() {
                    return Err(e);
                }
                if !st.open || st.unplugged || st.read_side_lost {
                    return Ok(None);
                }
                if let Some(chunk) = st.rx.pop_front() {
                    return Ok(Some(chunk));
                }
                if st.eof_pending {
                    st.eof_pending = false;
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    async fn cancel(&self) -> Result<(), IoError> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    fn release_lock(&self) -> Result<(), IoError> {
        let mut st = self.inner.state();
        if st.reader != Some(self.id) {
            return Err(IoError::released(&self.inner.name, "Reader lock already released"));
        }
        st.reader = None;
        Ok(())
    }
}

struct SimulatedWriter {
    inner: Arc<PortInner>,
    id: u64,
}

#[async_trait]
impl PortWriter for SimulatedWriter {
    async fn write(&self, bytes: &[u8]) -> Result<(), IoError> {
        let stalled = {
            let mut st = self.inner.state();
            if st.writer != Some(self.id) {
                return Err(IoError::released(&self.inner.name, "Writer lock was released"));
            }
            if !st.open || st.unplugged {
                return Err(IoError::closed(&self.inner.name, "The stream is closed"));
            }
            if let Some(e) = st.fail_write.take() {
                return Err(e);
            }
            if !st.stall_writes {
                st.written.extend_from_slice(bytes);
                st.writes.push(bytes.to_vec());
                if self.inner.echo {
                    st.rx.push_back(bytes.to_vec());
                }
            }
            st.stall_writes
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    fn release_lock(&self) -> Result<(), IoError> {
        let mut st = self.inner.state();
        if st.writer != Some(self.id) {
            return Err(IoError::released(&self.inner.name, "Writer lock already released"));
        }
        st.writer = None;
        Ok(())
    }
}

/// Lock a std mutex, recovering the data if a panicking holder poisoned it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
