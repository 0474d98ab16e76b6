// src/io/serial/session.rs
//
// Session controller: owns the single active serial connection.
//
// Lifecycle: Disconnected -> Connecting -> Connected -> Closing -> Disconnected.
// A Connected session may go straight back to Connecting when the user picks
// another port; the old connection is torn down first.
//
// Every read loop is started with the connection generation current at the
// time. Teardown bumps the generation, so a loop that outlives its connection
// notices at its next iteration and leaves the new connection's state alone.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::framer::FrameAssembler;
use super::registry::{PortDescriptor, PortRegistry};
use crate::io::codec::{self, Encoding};
use crate::io::transport::{PortReader, PortWriter, SerialTransport, StreamState};
use crate::io::{
    emit_error, emit_message, emit_state, CodecError, ConnectionConfig, ErrorReason, EventReceiver,
    EventSender, IoError, IoErrorKind, MessageRecord, SessionPhase,
};

/// Pause before re-acquiring a reader after a transient end of stream
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// Types
// ============================================================================

/// Tunables for the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    /// Watchdog applied to open and write. None waits indefinitely.
    pub io_timeout: Option<Duration>,
    pub restart_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            io_timeout: None,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

/// Snapshot of the session for status displays
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub port_id: Option<String>,
    pub port_name: Option<String>,
}

/// Mutable connection state, guarded by one async mutex
struct SessionState {
    phase: SessionPhase,
    active_port: Option<PortDescriptor>,
    reader: Option<Arc<dyn PortReader>>,
    writer: Option<Arc<dyn PortWriter>>,
    /// Bumped whenever a connection is established or torn down
    generation: u64,
    read_task: Option<JoinHandle<()>>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: SessionPhase::Disconnected,
            active_port: None,
            reader: None,
            writer: None,
            generation: 0,
            read_task: None,
        }
    }

    fn holds_resources(&self) -> bool {
        self.active_port.is_some()
            || self.reader.is_some()
            || self.writer.is_some()
            || self.read_task.is_some()
    }

    fn port_name(&self) -> Option<String> {
        self.active_port.as_ref().map(|p| p.name.clone())
    }

    fn device(&self) -> String {
        self.port_name().unwrap_or_else(|| "serial".to_string())
    }
}

// ============================================================================
// Session Controller
// ============================================================================

pub struct SessionController {
    registry: Option<PortRegistry>,
    state: Arc<Mutex<SessionState>>,
    config: Arc<RwLock<ConnectionConfig>>,
    options: SessionOptions,
    events: EventSender,
}

impl SessionController {
    /// Build a controller. `transport` is None when the platform has no
    /// serial support; every operation then fails with Unsupported.
    pub fn new(
        transport: Option<Arc<dyn SerialTransport>>,
        config: ConnectionConfig,
        options: SessionOptions,
    ) -> (Self, EventReceiver) {
        let (events, rx) = tokio::sync::mpsc::unbounded_channel();
        let controller = Self {
            registry: transport.map(PortRegistry::new),
            state: Arc::new(Mutex::new(SessionState::new())),
            config: Arc::new(RwLock::new(config)),
            options,
            events,
        };
        (controller, rx)
    }

    pub fn is_supported(&self) -> bool {
        self.registry.is_some()
    }

    fn registry(&self) -> Result<&PortRegistry, IoError> {
        self.registry.as_ref().ok_or_else(IoError::unsupported)
    }

    /// Ports the user has already authorized
    pub async fn list_ports(&self) -> Result<Vec<PortDescriptor>, IoError> {
        let registry = self.registry()?;
        registry.list_authorized().await.map_err(|e| {
            emit_error(&self.events, ErrorReason::Registry, e.to_string());
            e
        })
    }

    /// Prompt for a new port without connecting to it
    pub async fn request_port(&self) -> Result<Option<PortDescriptor>, IoError> {
        let registry = self.registry()?;
        registry.request_new().await.map_err(|e| {
            emit_error(&self.events, ErrorReason::Registry, e.to_string());
            e
        })
    }

    pub async fn status(&self) -> SessionStatus {
        let state = self.state.lock().await;
        SessionStatus {
            phase: state.phase,
            port_id: state.active_port.as_ref().map(|p| p.id.clone()),
            port_name: state.port_name(),
        }
    }

    pub fn config(&self) -> ConnectionConfig {
        read_config(&self.config)
    }

    /// Replace the live configuration. Read framing changes apply to the next
    /// received chunk; the baud rate only on reconnect.
    pub fn update_config(&self, config: ConnectionConfig) {
        let mut guard = self.config.write().unwrap_or_else(|e| e.into_inner());
        *guard = config;
    }

    // ========================================================================
    // Connect / Disconnect
    // ========================================================================

    /// Connect to `port`, or prompt the user for one when None.
    ///
    /// Returns `Ok(None)` when the user cancels the prompt; the session is
    /// then Disconnected and no error is surfaced. Also `Ok(None)` when a
    /// disconnect() or newer connect() lands while the port is still being
    /// chosen or opened; a port opened by the stale attempt is closed again.
    ///
    /// The session lock is not held across the prompt or the open.
    pub async fn connect(
        &self,
        baud_rate: u32,
        port: Option<PortDescriptor>,
    ) -> Result<Option<PortDescriptor>, IoError> {
        let registry = match self.registry() {
            Ok(r) => r,
            Err(e) => {
                emit_error(&self.events, ErrorReason::Unsupported, e.message.clone());
                return Err(e);
            }
        };
        if baud_rate == 0 {
            let err = IoError::connection("serial", "Baud rate must be a positive integer");
            emit_error(&self.events, ErrorReason::Connect, err.to_string());
            return Err(err);
        }

        // Claim the attempt under the lock, then let go of it: the prompt and
        // the open can take arbitrarily long and disconnect() must not wait
        let attempt = {
            let mut state = self.state.lock().await;

            // Never hold two connections: the previous one goes first
            if state.holds_resources() {
                tlog!("[serial:{}] Closing previous connection", state.device());
                for e in teardown(&mut state).await {
                    tlog!("[serial] Error closing previous connection: {}", e);
                }
            }

            state.generation += 1;
            state.phase = SessionPhase::Connecting;
            emit_state(&self.events, SessionPhase::Connecting, None);
            state.generation
        };

        let descriptor = match port {
            Some(p) => p,
            None => match registry.request_new().await {
                Ok(Some(p)) => p,
                Ok(None) => {
                    let mut state = self.state.lock().await;
                    if state.generation == attempt {
                        state.phase = SessionPhase::Disconnected;
                        emit_state(&self.events, SessionPhase::Disconnected, None);
                    }
                    return Ok(None);
                }
                Err(e) => return Err(self.fail_attempt(attempt, e).await),
            },
        };

        tlog!(
            "[serial:{}] Opening at {} baud",
            descriptor.name,
            baud_rate
        );
        if let Err(e) = self.open_port(&descriptor, baud_rate).await {
            return Err(self.fail_attempt(attempt, e).await);
        }

        let mut state = self.state.lock().await;
        if state.generation != attempt {
            // A disconnect() or another connect() ran while this one was opening
            tlog!(
                "[serial:{}] Connect superseded, closing port",
                descriptor.name
            );
            if let Err(e) = descriptor.handle.close().await {
                tlog!(
                    "[serial:{}] Close after superseded connect: {}",
                    descriptor.name,
                    e
                );
            }
            return Ok(None);
        }

        let (reader, writer) = match acquire_streams(&descriptor) {
            Ok(streams) => streams,
            Err(e) => {
                if let Err(close_err) = descriptor.handle.close().await {
                    tlog!(
                        "[serial:{}] Close after failed connect: {}",
                        descriptor.name,
                        close_err
                    );
                }
                return Err(self.fail_connect(&mut state, e));
            }
        };

        state.reader = Some(reader.clone());
        state.writer = Some(writer);
        state.active_port = Some(descriptor.clone());
        state.phase = SessionPhase::Connected;
        emit_state(
            &self.events,
            SessionPhase::Connected,
            Some(descriptor.name.clone()),
        );
        tlog!("[serial:{}] Connected ({})", descriptor.name, descriptor.id);

        let read_loop = ReadLoop {
            state: self.state.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            port: descriptor.clone(),
            generation: attempt,
            restart_delay: self.options.restart_delay,
        };
        state.read_task = Some(tokio::spawn(read_loop.run(reader)));

        Ok(Some(descriptor))
    }

    /// Open the port, retrying once after a close if it reports already open
    async fn open_port(&self, port: &PortDescriptor, baud_rate: u32) -> Result<(), IoError> {
        let limit = self.options.io_timeout;
        match with_watchdog(limit, &port.name, "open", port.handle.open(baud_rate)).await {
            Err(e) if e.kind == IoErrorKind::AlreadyOpen => {
                tlog!("[serial:{}] Port already open, closing and retrying", port.name);
                if let Err(close_err) = port.handle.close().await {
                    tlog!("[serial:{}] Close before retry: {}", port.name, close_err);
                }
                with_watchdog(limit, &port.name, "open", port.handle.open(baud_rate)).await
            }
            other => other,
        }
    }

    /// Failure before the streams are acquired. Only reported when the
    /// attempt is still the current one.
    async fn fail_attempt(&self, attempt: u64, e: IoError) -> IoError {
        let mut state = self.state.lock().await;
        if state.generation == attempt {
            self.fail_connect(&mut state, e)
        } else {
            tlog!("[serial:{}] Superseded connect failed: {}", e.device, e);
            e
        }
    }

    fn fail_connect(&self, state: &mut SessionState, e: IoError) -> IoError {
        state.phase = SessionPhase::Disconnected;
        state.active_port = None;
        emit_state(&self.events, SessionPhase::Disconnected, None);
        emit_error(&self.events, ErrorReason::Connect, e.to_string());
        e
    }

    /// Close the active connection. Safe to call at any time, any number of
    /// times; releases that fail because something is already gone are ignored.
    pub async fn disconnect(&self) -> Result<(), IoError> {
        let mut state = self.state.lock().await;
        if !state.holds_resources() && state.phase == SessionPhase::Disconnected {
            return Ok(());
        }

        let name = state.port_name();
        tlog!("[serial:{}] Disconnecting", state.device());
        state.phase = SessionPhase::Closing;
        emit_state(&self.events, SessionPhase::Closing, name);

        let unexpected = teardown(&mut state).await;
        emit_state(&self.events, SessionPhase::Disconnected, None);

        match unexpected.into_iter().next() {
            Some(e) => {
                emit_error(&self.events, ErrorReason::Disconnect, e.to_string());
                Err(e)
            }
            None => Ok(()),
        }
    }

    // ========================================================================
    // Send
    // ========================================================================

    /// Encode `text`, append the line ending from `config` and write it.
    /// Codec errors are returned to the caller only; write failures are also
    /// surfaced as Send errors.
    pub async fn send(
        &self,
        text: &str,
        encoding: Encoding,
        config: &ConnectionConfig,
    ) -> Result<MessageRecord, IoError> {
        let (writer, device, generation) = {
            let mut state = self.state.lock().await;
            let writer = match state.writer.clone() {
                Some(w) => w,
                None => match recover_writer(&mut state) {
                    Some(w) => w,
                    None => {
                        let err = IoError::not_connected();
                        emit_error(&self.events, ErrorReason::Send, err.message.clone());
                        return Err(err);
                    }
                },
            };
            (writer, state.device(), state.generation)
        };

        let encoded = codec::encode(text, encoding)?;
        let mut bytes = encoded.bytes;
        bytes.extend(config.send_suffix_in(encoding)?);
        if bytes.is_empty() {
            return Err(CodecError::new("No bytes to transmit").into());
        }

        // The state lock is not held while writing so the read loop and
        // disconnect keep running
        let result =
            with_watchdog(self.options.io_timeout, &device, "write", writer.write(&bytes)).await;
        if let Err(e) = result {
            let mut state = self.state.lock().await;
            if state.generation == generation {
                if e.indicates_closed_stream() {
                    tlog!("[serial:{}] Write side closed, tearing down", device);
                    for err in teardown(&mut state).await {
                        tlog!("[serial:{}] Teardown after write failure: {}", device, err);
                    }
                    emit_state(&self.events, SessionPhase::Disconnected, None);
                } else if let Some(w) = state.writer.take() {
                    // Dropped so the next send re-acquires a fresh writer
                    if let Err(release_err) = w.release_lock() {
                        tlog!("[serial:{}] Writer release: {}", device, release_err);
                    }
                }
            }
            emit_error(&self.events, ErrorReason::Send, e.to_string());
            return Err(e);
        }

        let record = MessageRecord::sent(text, encoding, encoded.rendered_text, bytes);
        emit_message(&self.events, record.clone());
        Ok(record)
    }

    /// Send a previously sent message again: same input, same encoding,
    /// line ending from `config`
    pub async fn resend(
        &self,
        record: &MessageRecord,
        config: &ConnectionConfig,
    ) -> Result<MessageRecord, IoError> {
        let input = record
            .original_input
            .as_deref()
            .ok_or_else(|| CodecError::new("Only sent messages can be resent"))?;
        self.send(input, record.encoding, config).await
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_lock() {
            state.generation += 1;
            if let Some(task) = state.read_task.take() {
                task.abort();
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn read_config(config: &RwLock<ConnectionConfig>) -> ConnectionConfig {
    config.read().unwrap_or_else(|e| e.into_inner()).clone()
}

async fn with_watchdog<T>(
    limit: Option<Duration>,
    device: &str,
    operation: &str,
    fut: impl Future<Output = Result<T, IoError>>,
) -> Result<T, IoError> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(IoError::timeout(device, operation)),
        },
        None => fut.await,
    }
}

/// Acquire the writer then the reader. On failure anything already acquired
/// is released again.
fn acquire_streams(
    port: &PortDescriptor,
) -> Result<(Arc<dyn PortReader>, Arc<dyn PortWriter>), IoError> {
    let writer = port
        .handle
        .writer()?
        .ok_or_else(|| IoError::connection(&port.name, "Port is not writable"))?;

    let reader = port
        .handle
        .reader()
        .and_then(|r| r.ok_or_else(|| IoError::connection(&port.name, "Port is not readable")));
    let reader = match reader {
        Ok(r) => r,
        Err(e) => {
            if let Err(release_err) = writer.release_lock() {
                tlog!(
                    "[serial:{}] Writer release after failed connect: {}",
                    port.name,
                    release_err
                );
            }
            return Err(e);
        }
    };

    Ok((reader, writer))
}

/// Re-acquire the writer when the port's writable stream is present and free
fn recover_writer(state: &mut SessionState) -> Option<Arc<dyn PortWriter>> {
    let port = state.active_port.as_ref()?;
    if port.handle.writable() != (StreamState::Available { locked: false }) {
        return None;
    }
    match port.handle.writer() {
        Ok(Some(w)) => {
            tlog!("[serial:{}] Writer recovered", port.name);
            state.writer = Some(w.clone());
            Some(w)
        }
        Ok(None) => None,
        Err(e) => {
            tlog!("[serial:{}] Writer recovery failed: {}", port.name, e);
            None
        }
    }
}

/// Canonical teardown: cancel the reader, release both locks, close the port.
///
/// Every step runs even if an earlier one failed. Failures that only mean
/// the resource was already gone are logged and dropped; anything else is
/// returned. Leaves the state Disconnected.
async fn teardown(state: &mut SessionState) -> Vec<IoError> {
    state.generation += 1;
    let device = state.device();
    let mut unexpected = Vec::new();
    let mut keep = |result: Result<(), IoError>, step: &str| {
        if let Err(e) = result {
            if e.is_teardown_expected() {
                tlog!("[serial:{}] Ignoring {} error during teardown: {}", device, step, e);
            } else {
                unexpected.push(e);
            }
        }
    };

    if let Some(reader) = state.reader.take() {
        keep(reader.cancel().await, "cancel");
        keep(reader.release_lock(), "reader release");
    }
    if let Some(writer) = state.writer.take() {
        keep(writer.release_lock(), "writer release");
    }
    if let Some(port) = state.active_port.take() {
        keep(port.handle.close().await, "close");
    }
    if let Some(task) = state.read_task.take() {
        task.abort();
    }

    state.phase = SessionPhase::Disconnected;
    unexpected
}

// ============================================================================
// Read Loop
// ============================================================================

struct ReadLoop {
    state: Arc<Mutex<SessionState>>,
    config: Arc<RwLock<ConnectionConfig>>,
    events: EventSender,
    port: PortDescriptor,
    /// Connection generation this loop belongs to
    generation: u64,
    restart_delay: Duration,
}

impl ReadLoop {
    async fn is_current(&self) -> bool {
        self.state.lock().await.generation == self.generation
    }

    async fn run(self, mut reader: Arc<dyn PortReader>) {
        let name = self.port.name.clone();
        let mut assembler = FrameAssembler::new(read_config(&self.config).framing_policy());
        tlog!("[serial:{}] Read loop started", name);

        loop {
            if !self.is_current().await {
                break;
            }

            match reader.read().await {
                Ok(Some(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    // Framing follows the live config, checked per chunk
                    let policy = read_config(&self.config).framing_policy();
                    if assembler.set_policy(policy) {
                        tlog!("[serial:{}] Framing changed, pending bytes dropped", name);
                    }
                    for frame in assembler.push(&chunk) {
                        emit_message(&self.events, MessageRecord::received(frame));
                    }
                }
                Ok(None) => {
                    if !self.is_current().await {
                        break;
                    }
                    if !self.port.handle.readable().is_available() {
                        tlog!("[serial:{}] Readable stream gone", name);
                        break;
                    }
                    // Transient end of stream: wait, then take a fresh reader
                    tokio::time::sleep(self.restart_delay).await;
                    match self.reacquire(&reader).await {
                        Some(r) => reader = r,
                        None => break,
                    }
                }
                Err(e) => {
                    if e.is_teardown_expected() || !self.is_current().await {
                        tlog!("[serial:{}] Read ended: {}", name, e);
                    } else {
                        emit_error(&self.events, ErrorReason::Read, e.to_string());
                    }
                    break;
                }
            }
        }

        self.finish(assembler).await;
        tlog!("[serial:{}] Read loop stopped", name);
    }

    /// Swap in a new reader after a transient end. None when the loop should stop.
    async fn reacquire(&self, old: &Arc<dyn PortReader>) -> Option<Arc<dyn PortReader>> {
        let mut state = self.state.lock().await;
        if state.generation != self.generation {
            return None;
        }
        if let Err(e) = old.release_lock() {
            tlog!("[serial:{}] Old reader release: {}", self.port.name, e);
        }
        state.reader = None;

        match self.port.handle.reader() {
            Ok(Some(r)) => {
                tlog!("[serial:{}] Reader re-acquired", self.port.name);
                state.reader = Some(r.clone());
                Some(r)
            }
            Ok(None) => None,
            Err(e) => {
                tlog!("[serial:{}] Reader re-acquire failed: {}", self.port.name, e);
                None
            }
        }
    }

    /// Exit path. A superseded loop touches nothing.
    async fn finish(&self, mut assembler: FrameAssembler) {
        let mut state = self.state.lock().await;
        if state.generation != self.generation {
            return;
        }

        if let Some(frame) = assembler.flush() {
            emit_message(&self.events, MessageRecord::received(frame));
        }

        // This task is ending on its own; nothing left to abort
        state.read_task = None;
        if let Some(reader) = state.reader.take() {
            if let Err(e) = reader.release_lock() {
                tlog!("[serial:{}] Reader release on exit: {}", self.port.name, e);
            }
        }

        if self.port.handle.writable().is_available() {
            tlog!(
                "[serial:{}] Read side ended, port still writable",
                self.port.name
            );
            return;
        }

        tlog!("[serial:{}] Port lost", self.port.name);
        for e in teardown(&mut state).await {
            tlog!("[serial:{}] Teardown after port loss: {}", self.port.name, e);
        }
        emit_state(&self.events, SessionPhase::Disconnected, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::serial::simulated::{RequestOutcome, SimulatedPort, SimulatedTransport};
    use crate::io::{Direction, LineEnding, PortIdentity, ReadLineEnding, SessionEvent};
    use tokio::sync::Notify;

    fn setup(
        ports: Vec<Arc<SimulatedPort>>,
        config: ConnectionConfig,
    ) -> (SessionController, EventReceiver, Arc<SimulatedTransport>) {
        let transport = Arc::new(SimulatedTransport::with_ports(ports));
        let options = SessionOptions {
            io_timeout: None,
            restart_delay: Duration::from_millis(5),
        };
        let (controller, rx) = SessionController::new(Some(transport.clone()), config, options);
        (controller, rx, transport)
    }

    async fn descriptor(controller: &SessionController, index: usize) -> PortDescriptor {
        controller.list_ports().await.unwrap().remove(index)
    }

    async fn next_message(rx: &mut EventReceiver) -> MessageRecord {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if let SessionEvent::Message(record) = event {
                return record;
            }
        }
    }

    async fn wait_for_phase(controller: &SessionController, phase: SessionPhase) {
        for _ in 0..200 {
            if controller.status().await.phase == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never reached {:?}", phase);
    }

    async fn wait_for_reader_release(port: &SimulatedPort) {
        for _ in 0..200 {
            if !port.reader_held() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("reader never released");
    }

    fn drain(rx: &mut EventReceiver) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn errors(events: &[SessionEvent]) -> Vec<ErrorReason> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Error { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let port = SimulatedPort::new("Uno", PortIdentity::usb(0x2341, 0x0043));
        let (controller, mut rx, _) = setup(vec![port.clone()], ConnectionConfig::default());

        let target = descriptor(&controller, 0).await;
        let connected = controller.connect(9600, Some(target)).await.unwrap();
        assert_eq!(connected.unwrap().id, "usb-2341-0043");
        assert!(port.is_open());
        assert_eq!(port.baud_rate(), Some(9600));
        assert!(port.reader_held());
        assert!(port.writer_held());

        let status = controller.status().await;
        assert_eq!(status.phase, SessionPhase::Connected);
        assert_eq!(status.port_id.as_deref(), Some("usb-2341-0043"));

        controller.disconnect().await.unwrap();
        assert!(!port.is_open());
        assert!(!port.reader_held());
        assert!(!port.writer_held());
        assert_eq!(controller.status().await.phase, SessionPhase::Disconnected);

        let phases: Vec<SessionPhase> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::ConnectionState { phase, .. } => Some(phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                SessionPhase::Connecting,
                SessionPhase::Connected,
                SessionPhase::Closing,
                SessionPhase::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        let (controller, mut rx, _) = setup(vec![port.clone()], ConnectionConfig::default());

        // Never connected
        controller.disconnect().await.unwrap();

        let target = descriptor(&controller, 0).await;
        controller.connect(115_200, Some(target)).await.unwrap();
        controller.disconnect().await.unwrap();
        controller.disconnect().await.unwrap();
        controller.disconnect().await.unwrap();

        assert!(errors(&drain(&mut rx)).is_empty());
        assert_eq!(controller.status().await.phase, SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_releases_previous_port_first() {
        let first = SimulatedPort::new("First", PortIdentity::usb(1, 1));
        let second = SimulatedPort::new("Second", PortIdentity::usb(2, 2));
        let (controller, _rx, _) = setup(
            vec![first.clone(), second.clone()],
            ConnectionConfig::default(),
        );

        let a = descriptor(&controller, 0).await;
        let b = descriptor(&controller, 1).await;
        controller.connect(9600, Some(a.clone())).await.unwrap();

        // Same port again: would fail with Locked if the old reader survived
        controller.connect(9600, Some(a)).await.unwrap();
        assert_eq!(first.reader_acquisitions(), 2);

        controller.connect(9600, Some(b)).await.unwrap();
        assert!(!first.is_open());
        assert!(!first.reader_held());
        assert!(second.reader_held());
        assert_eq!(
            controller.status().await.port_id.as_deref(),
            Some("usb-0002-0002")
        );

        controller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let (controller, mut rx, _) = setup(vec![], ConnectionConfig::default());

        let err = controller.send("hello", Encoding::Ascii, &controller.config()).await.unwrap_err();
        assert_eq!(err.kind, IoErrorKind::NotConnected);
        assert_eq!(errors(&drain(&mut rx)), vec![ErrorReason::Send]);
    }

    #[tokio::test]
    async fn test_send_appends_line_ending() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        let config = ConnectionConfig {
            line_ending: LineEnding::Crlf,
            ..Default::default()
        };
        let (controller, mut rx, _) = setup(vec![port.clone()], config);
        let target = descriptor(&controller, 0).await;
        controller.connect(9600, Some(target)).await.unwrap();

        let record = controller.send("AT", Encoding::Ascii, &controller.config()).await.unwrap();
        assert_eq!(record.direction, Direction::Sent);
        assert_eq!(record.raw_bytes, b"AT\r\n".to_vec());
        assert_eq!(record.original_input.as_deref(), Some("AT"));
        assert_eq!(port.written(), b"AT\r\n".to_vec());

        let emitted = next_message(&mut rx).await;
        assert_eq!(emitted.id, record.id);

        controller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_codec_error_is_not_surfaced() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        let (controller, mut rx, _) = setup(vec![port.clone()], ConnectionConfig::default());
        let target = descriptor(&controller, 0).await;
        controller.connect(9600, Some(target)).await.unwrap();
        drain(&mut rx);

        let err = controller.send("GG", Encoding::Hex, &controller.config()).await.unwrap_err();
        assert!(matches!(err.kind, IoErrorKind::Codec(_)));
        assert!(port.written().is_empty());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(controller.status().await.phase, SessionPhase::Connected);

        controller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_resend_uses_original_input_and_encoding() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        let config = ConnectionConfig {
            line_ending: LineEnding::Lf,
            ..Default::default()
        };
        let (controller, _rx, _) = setup(vec![port.clone()], config);
        let target = descriptor(&controller, 0).await;
        controller.connect(9600, Some(target)).await.unwrap();

        let first = controller.send("0x1,0x2A", Encoding::Hex, &controller.config()).await.unwrap();
        let again = controller.resend(&first, &controller.config()).await.unwrap();
        assert_ne!(first.id, again.id);
        assert_eq!(again.encoding, Encoding::Hex);
        assert_eq!(again.raw_bytes, first.raw_bytes);
        assert_eq!(
            port.writes(),
            vec![vec![0x01, 0x2A, 0x0A], vec![0x01, 0x2A, 0x0A]]
        );

        let received = MessageRecord::received(crate::io::SerialFrame {
            bytes: vec![1],
            incomplete: false,
        });
        assert!(controller.resend(&received, &controller.config()).await.is_err());

        controller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_immediate_receive() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        let (controller, mut rx, _) = setup(vec![port.clone()], ConnectionConfig::default());
        let target = descriptor(&controller, 0).await;
        controller.connect(9600, Some(target)).await.unwrap();

        port.inject(b"AB");
        port.inject(b"CD\n");

        let first = next_message(&mut rx).await;
        assert_eq!(first.direction, Direction::Received);
        assert_eq!(first.raw_bytes, b"AB".to_vec());
        assert_eq!(first.rendered_text, "41 42");
        assert_eq!(next_message(&mut rx).await.raw_bytes, b"CD\n".to_vec());

        controller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_delimited_receive_across_chunks() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        let config = ConnectionConfig {
            read_until_line_ending: true,
            read_line_ending: ReadLineEnding::Lf,
            ..Default::default()
        };
        let (controller, mut rx, _) = setup(vec![port.clone()], config);
        let target = descriptor(&controller, 0).await;
        controller.connect(9600, Some(target)).await.unwrap();

        port.inject(b"AB");
        port.inject(b"CD\n");
        port.inject(b"EF");

        let frame = next_message(&mut rx).await;
        assert_eq!(frame.raw_bytes, b"ABCD\n".to_vec());
        assert!(frame.incomplete.is_none());

        // "EF" stays pending; a user disconnect supersedes the loop, so it
        // is not flushed
        controller.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(drain(&mut rx)
            .iter()
            .all(|e| !matches!(e, SessionEvent::Message(_))));
    }

    #[tokio::test]
    async fn test_config_change_applies_to_next_chunk() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        let (controller, mut rx, _) = setup(vec![port.clone()], ConnectionConfig::default());
        let target = descriptor(&controller, 0).await;
        controller.connect(9600, Some(target)).await.unwrap();

        port.inject(b"one");
        assert_eq!(next_message(&mut rx).await.raw_bytes, b"one".to_vec());

        controller.update_config(ConnectionConfig {
            read_until_line_ending: true,
            read_line_ending: ReadLineEnding::Cr,
            ..Default::default()
        });
        port.inject(b"tw");
        port.inject(b"o\rthree");
        assert_eq!(next_message(&mut rx).await.raw_bytes, b"two\r".to_vec());

        controller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_end_reacquires_reader() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        let (controller, mut rx, _) = setup(vec![port.clone()], ConnectionConfig::default());
        let target = descriptor(&controller, 0).await;
        controller.connect(9600, Some(target)).await.unwrap();

        port.inject_eof();
        for _ in 0..200 {
            if port.reader_acquisitions() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(port.reader_acquisitions(), 2);
        assert_eq!(controller.status().await.phase, SessionPhase::Connected);

        port.inject(b"after");
        assert_eq!(next_message(&mut rx).await.raw_bytes, b"after".to_vec());

        controller.disconnect().await.unwrap();
        assert!(!port.reader_held());
    }

    #[tokio::test]
    async fn test_unplug_disconnects_and_flushes_partial_frame() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        let config = ConnectionConfig {
            read_until_line_ending: true,
            ..Default::default()
        };
        let (controller, mut rx, _) = setup(vec![port.clone()], config);
        let target = descriptor(&controller, 0).await;
        controller.connect(9600, Some(target)).await.unwrap();

        port.inject(b"partial");
        tokio::time::sleep(Duration::from_millis(20)).await;
        port.unplug();

        let frame = next_message(&mut rx).await;
        assert_eq!(frame.raw_bytes, b"partial".to_vec());
        assert_eq!(frame.incomplete, Some(true));

        wait_for_phase(&controller, SessionPhase::Disconnected).await;
        assert!(!port.reader_held());
        assert!(!port.writer_held());

        // Nothing left to send through
        let err = controller.send("x", Encoding::Ascii, &controller.config()).await.unwrap_err();
        assert_eq!(err.kind, IoErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_closed_write_tears_down() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        let (controller, mut rx, _) = setup(vec![port.clone()], ConnectionConfig::default());
        let target = descriptor(&controller, 0).await;
        controller.connect(9600, Some(target)).await.unwrap();
        drain(&mut rx);

        port.fail_next_write(IoError::closed("Uno", "The stream is closed"));
        assert!(controller.send("x", Encoding::Ascii, &controller.config()).await.is_err());

        assert_eq!(controller.status().await.phase, SessionPhase::Disconnected);
        assert!(!port.is_open());
        assert_eq!(errors(&drain(&mut rx)), vec![ErrorReason::Send]);
    }

    #[tokio::test]
    async fn test_write_error_recovers_writer() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        let (controller, _rx, _) = setup(vec![port.clone()], ConnectionConfig::default());
        let target = descriptor(&controller, 0).await;
        controller.connect(9600, Some(target)).await.unwrap();

        port.fail_next_write(IoError::write("Uno", "Parity error"));
        assert!(controller.send("x", Encoding::Ascii, &controller.config()).await.is_err());
        assert_eq!(controller.status().await.phase, SessionPhase::Connected);
        assert!(!port.writer_held());

        controller.send("y", Encoding::Ascii, &controller.config()).await.unwrap();
        assert_eq!(port.written(), b"y".to_vec());
        assert!(port.writer_held());

        controller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_already_open_retries_once() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        port.force_open();
        let (controller, _rx, _) = setup(vec![port.clone()], ConnectionConfig::default());
        let target = descriptor(&controller, 0).await;

        controller.connect(9600, Some(target)).await.unwrap();
        assert_eq!(port.open_calls(), 2);
        assert_eq!(controller.status().await.phase, SessionPhase::Connected);

        controller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_failure_surfaces_connect_error() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        port.fail_next_open(IoError::connection("Uno", "Access denied"));
        let (controller, mut rx, _) = setup(vec![port.clone()], ConnectionConfig::default());
        let target = descriptor(&controller, 0).await;

        assert!(controller.connect(9600, Some(target)).await.is_err());
        assert_eq!(controller.status().await.phase, SessionPhase::Disconnected);
        assert_eq!(errors(&drain(&mut rx)), vec![ErrorReason::Connect]);
    }

    #[tokio::test]
    async fn test_reader_failure_releases_writer_and_closes() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        port.fail_reader(true);
        let (controller, _rx, _) = setup(vec![port.clone()], ConnectionConfig::default());
        let target = descriptor(&controller, 0).await;

        assert!(controller.connect(9600, Some(target)).await.is_err());
        assert!(!port.writer_held());
        assert!(!port.is_open());
    }

    #[tokio::test]
    async fn test_prompt_cancel_is_silent() {
        let (controller, mut rx, transport) = setup(vec![], ConnectionConfig::default());
        transport.queue_request(RequestOutcome::Cancel);

        assert!(controller.connect(9600, None).await.unwrap().is_none());
        assert_eq!(controller.status().await.phase, SessionPhase::Disconnected);
        assert!(errors(&drain(&mut rx)).is_empty());
    }

    #[tokio::test]
    async fn test_prompt_select_connects() {
        let port = SimulatedPort::new("CP2102", PortIdentity::usb(0x10c4, 0xea60));
        let (controller, _rx, transport) = setup(vec![], ConnectionConfig::default());
        transport.queue_request(RequestOutcome::Select(port.clone()));

        let connected = controller.connect(57_600, None).await.unwrap().unwrap();
        assert_eq!(connected.id, "usb-10c4-ea60");
        assert_eq!(port.baud_rate(), Some(57_600));

        controller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_prompt_failure_surfaces_connect_error() {
        let (controller, mut rx, transport) = setup(vec![], ConnectionConfig::default());
        transport.queue_request(RequestOutcome::Fail("Permission denied".to_string()));

        let err = controller.connect(9600, None).await.unwrap_err();
        assert_eq!(err.kind, IoErrorKind::Platform);
        assert_eq!(controller.status().await.phase, SessionPhase::Disconnected);
        assert_eq!(errors(&drain(&mut rx)), vec![ErrorReason::Connect]);
    }

    #[tokio::test]
    async fn test_disconnect_while_prompt_open() {
        let port = SimulatedPort::new("Late", PortIdentity::default());
        let (controller, mut rx, transport) = setup(vec![], ConnectionConfig::default());
        let release = Arc::new(Notify::new());
        transport.queue_request(RequestOutcome::Hold(release.clone(), port.clone()));

        let controller = Arc::new(controller);
        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.connect(9600, None).await })
        };

        tokio::time::timeout(
            Duration::from_secs(1),
            wait_for_phase(&controller, SessionPhase::Connecting),
        )
        .await
        .expect("status answers while the prompt is open");
        tokio::time::timeout(Duration::from_secs(1), controller.disconnect())
            .await
            .expect("disconnect answers while the prompt is open")
            .unwrap();
        assert_eq!(controller.status().await.phase, SessionPhase::Disconnected);

        // The user picks a port after all: the stale attempt must not connect
        release.notify_one();
        assert!(pending.await.unwrap().unwrap().is_none());
        assert_eq!(port.open_calls(), 1);
        assert!(!port.is_open());
        assert!(!port.reader_held());
        assert_eq!(controller.status().await.phase, SessionPhase::Disconnected);
        assert!(errors(&drain(&mut rx)).is_empty());
    }

    #[tokio::test]
    async fn test_read_error_surfaces_once_and_stops_loop() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        let (controller, mut rx, _) = setup(vec![port.clone()], ConnectionConfig::default());
        let target = descriptor(&controller, 0).await;
        controller.connect(9600, Some(target)).await.unwrap();
        drain(&mut rx);

        port.fail_next_read(IoError::read("Uno", "Framing error"));
        wait_for_reader_release(&port).await;

        port.inject(b"ignored");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let events = drain(&mut rx);
        assert_eq!(errors(&events), vec![ErrorReason::Read]);
        assert!(events.iter().all(|e| !matches!(e, SessionEvent::Message(_))));

        // Write side is untouched
        assert_eq!(controller.status().await.phase, SessionPhase::Connected);
        controller.send("x", Encoding::Ascii, &controller.config()).await.unwrap();

        controller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_side_loss_keeps_writable_session() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        let (controller, mut rx, _) = setup(vec![port.clone()], ConnectionConfig::default());
        let target = descriptor(&controller, 0).await;
        controller.connect(9600, Some(target)).await.unwrap();
        drain(&mut rx);

        port.lose_read_side();
        wait_for_reader_release(&port).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(controller.status().await.phase, SessionPhase::Connected);
        assert!(port.is_open());
        assert!(port.writer_held());
        assert_eq!(port.reader_acquisitions(), 1);
        assert!(errors(&drain(&mut rx)).is_empty());

        controller.send("still", Encoding::Ascii, &controller.config()).await.unwrap();
        assert_eq!(port.written(), b"still".to_vec());

        controller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_reports_unexpected_close_failure() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        let (controller, mut rx, _) = setup(vec![port.clone()], ConnectionConfig::default());
        let target = descriptor(&controller, 0).await;
        controller.connect(9600, Some(target)).await.unwrap();
        drain(&mut rx);

        port.fail_next_close(IoError::connection("Uno", "Device busy"));
        let err = controller.disconnect().await.unwrap_err();
        assert_eq!(err.kind, IoErrorKind::Connection);
        assert_eq!(controller.status().await.phase, SessionPhase::Disconnected);
        assert!(!port.reader_held());
        assert!(!port.writer_held());
        assert_eq!(errors(&drain(&mut rx)), vec![ErrorReason::Disconnect]);

        // Nothing left to release
        controller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_platform() {
        let (controller, mut rx) =
            SessionController::new(None, ConnectionConfig::default(), SessionOptions::default());

        assert!(!controller.is_supported());
        let err = controller.connect(9600, None).await.unwrap_err();
        assert_eq!(err.kind, IoErrorKind::Unsupported);
        assert_eq!(errors(&drain(&mut rx)), vec![ErrorReason::Unsupported]);
        assert!(controller.list_ports().await.is_err());
    }

    #[tokio::test]
    async fn test_write_watchdog() {
        let port = SimulatedPort::new("Uno", PortIdentity::default());
        let transport = Arc::new(SimulatedTransport::with_ports(vec![port.clone()]));
        let options = SessionOptions {
            io_timeout: Some(Duration::from_millis(20)),
            restart_delay: Duration::from_millis(5),
        };
        let (controller, _rx) =
            SessionController::new(Some(transport), ConnectionConfig::default(), options);
        let target = descriptor(&controller, 0).await;
        controller.connect(9600, Some(target)).await.unwrap();

        port.stall_writes(true);
        let err = controller.send("x", Encoding::Ascii, &controller.config()).await.unwrap_err();
        assert_eq!(err.kind, IoErrorKind::Timeout);
        assert_eq!(controller.status().await.phase, SessionPhase::Connected);
    }

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let port = SimulatedPort::loopback("loop");
        let (controller, mut rx, _) = setup(vec![port.clone()], ConnectionConfig::default());
        let target = descriptor(&controller, 0).await;
        controller.connect(9600, Some(target)).await.unwrap();

        let sent = controller.send("SGk=", Encoding::Base64, &controller.config()).await.unwrap();
        assert_eq!(next_message(&mut rx).await.id, sent.id);

        let echoed = next_message(&mut rx).await;
        assert_eq!(echoed.direction, Direction::Received);
        assert_eq!(echoed.raw_bytes, b"Hi".to_vec());

        controller.disconnect().await.unwrap();
    }
}
