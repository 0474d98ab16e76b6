// src/io/mod.rs
//
// Serial IO for the terminal: payload codec, transport capability interface,
// and the session engine that owns the single active connection.
// Shared record/event types used by the session and the message log live here.

pub mod codec;
mod error;
pub mod serial;
pub mod transport;

pub use codec::{decode, encode, line_ending_bytes, EncodedPayload, Encoding, LineEnding};
pub use error::{CodecError, ErrorReason, IoError, IoErrorKind};
pub use serial::{
    FrameAssembler, FramingPolicy, PortDescriptor, PortRegistry, SerialFrame, SessionController,
    SessionOptions, SessionStatus,
};
pub use transport::{PortHandle, PortIdentity, PortReader, PortWriter, SerialTransport, StreamState};

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use uuid::Uuid;

use serial::framer::DEFAULT_MAX_FRAME_LENGTH;

// ============================================================================
// Connection Configuration
// ============================================================================

/// Line ending that terminates incoming frames
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadLineEnding {
    Cr,
    Lf,
    Crlf,
    Custom,
}

impl Default for ReadLineEnding {
    fn default() -> Self {
        ReadLineEnding::Lf
    }
}

impl std::str::FromStr for ReadLineEnding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cr" => Ok(ReadLineEnding::Cr),
            "lf" => Ok(ReadLineEnding::Lf),
            "crlf" => Ok(ReadLineEnding::Crlf),
            "custom" => Ok(ReadLineEnding::Custom),
            _ => Err(format!("Unknown read line ending: {}", s)),
        }
    }
}

/// Per-send / per-chunk connection configuration.
/// `baud_rate` is fixed at connect time; the line-ending fields may change
/// while connected and apply to the next send or received chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub baud_rate: u32,
    #[serde(default)]
    pub line_ending: LineEnding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_line_ending: Option<String>,
    #[serde(default)]
    pub read_until_line_ending: bool,
    #[serde(default)]
    pub read_line_ending: ReadLineEnding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_custom_line_ending: Option<String>,
    /// Pending receive bytes allowed before a frame is forced out
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            line_ending: LineEnding::None,
            custom_line_ending: None,
            read_until_line_ending: false,
            read_line_ending: ReadLineEnding::Lf,
            read_custom_line_ending: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ConnectionConfig {
    /// Bytes appended to every outgoing payload
    pub fn send_suffix(&self) -> Vec<u8> {
        line_ending_bytes(self.line_ending, self.custom_line_ending.as_deref())
    }

    /// Suffix for a payload sent in `encoding`. A custom ending is written
    /// in the same encoding as the payload it follows.
    pub fn send_suffix_in(&self, encoding: Encoding) -> Result<Vec<u8>, CodecError> {
        match (self.line_ending, self.custom_line_ending.as_deref()) {
            (LineEnding::Custom, Some(custom)) if !custom.is_empty() => {
                Ok(encode(custom, encoding)?.bytes)
            }
            _ => Ok(self.send_suffix()),
        }
    }

    /// Receive-side delimiter bytes
    pub fn read_delimiter(&self) -> Vec<u8> {
        match self.read_line_ending {
            ReadLineEnding::Cr => vec![0x0D],
            ReadLineEnding::Lf => vec![0x0A],
            ReadLineEnding::Crlf => vec![0x0D, 0x0A],
            ReadLineEnding::Custom => self
                .read_custom_line_ending
                .as_deref()
                .map(|s| s.as_bytes().to_vec())
                .unwrap_or_default(),
        }
    }

    /// Framing policy for the read loop
    pub fn framing_policy(&self) -> FramingPolicy {
        if self.read_until_line_ending {
            FramingPolicy::Delimited {
                delimiter: self.read_delimiter(),
                max_length: self.max_frame_length,
            }
        } else {
            FramingPolicy::Immediate
        }
    }
}

// ============================================================================
// Message Records
// ============================================================================

/// Get current time in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// One sent or received message. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub direction: Direction,
    /// Sent: bytes written, including the line ending. Received: frame bytes.
    pub raw_bytes: Vec<u8>,
    /// Encoding active when the record was created
    pub encoding: Encoding,
    pub rendered_text: String,
    /// Sent only: the text the user typed, for exact resend
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original_input: Option<String>,
    /// Host UNIX timestamp in microseconds.
    pub timestamp_us: u64,
    /// Received frame flushed without its delimiter
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub incomplete: Option<bool>,
}

impl MessageRecord {
    pub fn sent(input: &str, encoding: Encoding, rendered_text: String, raw_bytes: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            direction: Direction::Sent,
            raw_bytes,
            encoding,
            rendered_text,
            original_input: Some(input.to_string()),
            timestamp_us: now_us(),
            incomplete: None,
        }
    }

    /// Received frames are rendered as hex until the user picks a display encoding
    pub fn received(frame: SerialFrame) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            direction: Direction::Received,
            rendered_text: decode(&frame.bytes, Encoding::Hex),
            raw_bytes: frame.bytes,
            encoding: Encoding::Hex,
            original_input: None,
            timestamp_us: now_us(),
            incomplete: frame.incomplete.then_some(true),
        }
    }
}

// ============================================================================
// Session Events
// ============================================================================

/// Connection lifecycle phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Events emitted by the session controller to the surrounding application
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Message(MessageRecord),
    ConnectionState {
        phase: SessionPhase,
        port_name: Option<String>,
    },
    Error {
        reason: ErrorReason,
        message: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Emit a message record. A dropped receiver is not an error.
pub fn emit_message(tx: &EventSender, record: MessageRecord) {
    let _ = tx.send(SessionEvent::Message(record));
}

pub fn emit_state(tx: &EventSender, phase: SessionPhase, port_name: Option<String>) {
    let _ = tx.send(SessionEvent::ConnectionState { phase, port_name });
}

/// Surface an error to the user (and the log)
pub fn emit_error(tx: &EventSender, reason: ErrorReason, message: impl Into<String>) {
    let message = message.into();
    tlog!("[serial] {:?} error: {}", reason, message);
    let _ = tx.send(SessionEvent::Error { reason, message });
}
