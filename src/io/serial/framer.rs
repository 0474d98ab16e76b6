// src/io/serial/framer.rs
//
// Frame assembly for the serial read loop.
// Turns the chunks delivered by the transport into discrete messages, either
// one frame per chunk (immediate) or buffered until a delimiter is seen.

use serde::{Deserialize, Serialize};

/// Pending bytes allowed before a delimiter-less buffer is force-flushed
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024;

// =============================================================================
// Types
// =============================================================================

/// Framing policy applied to incoming bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FramingPolicy {
    /// Every chunk read from the port is one frame
    Immediate,
    /// Buffer until the delimiter byte sequence is seen
    Delimited {
        /// Delimiter byte sequence (e.g., [0x0D, 0x0A] for CRLF). Empty never matches.
        delimiter: Vec<u8>,
        /// Pending length at which the buffer is flushed without a delimiter
        max_length: usize,
    },
}

impl Default for FramingPolicy {
    fn default() -> Self {
        FramingPolicy::Immediate
    }
}

/// A complete frame extracted from the serial stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
    /// Frame bytes, including the delimiter when one terminated the frame
    pub bytes: Vec<u8>,
    /// Frame was emitted without its delimiter (max length reached or flush())
    pub incomplete: bool,
}

// =============================================================================
// Internal Framer Trait
// =============================================================================

trait FramerImpl {
    fn feed(&mut self, data: &[u8]) -> Vec<SerialFrame>;
    fn flush(&mut self) -> Option<SerialFrame>;
    fn pending(&self) -> usize;
}

// =============================================================================
// Delimiter-Based Framer
// =============================================================================

struct DelimiterFramer {
    buffer: Vec<u8>,
    delimiter: Vec<u8>,
    max_length: usize,
    /// Buffer prefix already known not to contain the start of a delimiter
    searched: usize,
}

impl DelimiterFramer {
    fn new(delimiter: Vec<u8>, max_length: usize) -> Self {
        DelimiterFramer {
            buffer: Vec::new(),
            delimiter,
            max_length: max_length.max(1),
            searched: 0,
        }
    }

    fn find_delimiter(&self) -> Option<usize> {
        if self.delimiter.is_empty() || self.buffer.len() < self.delimiter.len() {
            return None;
        }
        self.buffer[self.searched..]
            .windows(self.delimiter.len())
            .position(|w| w == self.delimiter.as_slice())
            .map(|pos| pos + self.searched)
    }
}

impl FramerImpl for DelimiterFramer {
    fn feed(&mut self, data: &[u8]) -> Vec<SerialFrame> {
        let mut frames = Vec::new();
        self.buffer.extend_from_slice(data);

        // Several frames may have arrived in one chunk
        while let Some(pos) = self.find_delimiter() {
            let end = pos + self.delimiter.len();
            let frame: Vec<u8> = self.buffer.drain(..end).collect();
            self.searched = 0;
            frames.push(SerialFrame {
                bytes: frame,
                incomplete: false,
            });
        }

        // A delimiter may still straddle the next chunk boundary
        let keep = self.delimiter.len().saturating_sub(1);
        self.searched = self.buffer.len().saturating_sub(keep);

        // Force split on max length
        if self.buffer.len() >= self.max_length {
            let frame: Vec<u8> = self.buffer.drain(..).collect();
            self.searched = 0;
            frames.push(SerialFrame {
                bytes: frame,
                incomplete: true,
            });
        }

        frames
    }

    fn flush(&mut self) -> Option<SerialFrame> {
        self.searched = 0;
        if self.buffer.is_empty() {
            None
        } else {
            Some(SerialFrame {
                bytes: self.buffer.drain(..).collect(),
                incomplete: true,
            })
        }
    }

    fn pending(&self) -> usize {
        self.buffer.len()
    }
}

// =============================================================================
// Immediate Framer (Pass-through)
// =============================================================================

/// Passes each chunk through as its own frame
struct ImmediateFramer;

impl FramerImpl for ImmediateFramer {
    fn feed(&mut self, data: &[u8]) -> Vec<SerialFrame> {
        if data.is_empty() {
            return Vec::new();
        }
        vec![SerialFrame {
            bytes: data.to_vec(),
            incomplete: false,
        }]
    }

    fn flush(&mut self) -> Option<SerialFrame> {
        None
    }

    fn pending(&self) -> usize {
        0
    }
}

// =============================================================================
// Public FrameAssembler
// =============================================================================

/// Stateful frame assembler for streaming data.
/// Changing the policy discards anything buffered under the previous one.
pub struct FrameAssembler {
    policy: FramingPolicy,
    framer: Box<dyn FramerImpl + Send>,
}

impl FrameAssembler {
    /// Create a new assembler with the specified policy
    pub fn new(policy: FramingPolicy) -> Self {
        let framer = Self::build(&policy);
        FrameAssembler { policy, framer }
    }

    fn build(policy: &FramingPolicy) -> Box<dyn FramerImpl + Send> {
        match policy {
            FramingPolicy::Immediate => Box::new(ImmediateFramer),
            FramingPolicy::Delimited {
                delimiter,
                max_length,
            } => Box::new(DelimiterFramer::new(delimiter.clone(), *max_length)),
        }
    }

    pub fn policy(&self) -> &FramingPolicy {
        &self.policy
    }

    /// Switch policy. Returns true (and clears the buffer) if it changed.
    pub fn set_policy(&mut self, policy: FramingPolicy) -> bool {
        if policy == self.policy {
            return false;
        }
        self.framer = Self::build(&policy);
        self.policy = policy;
        true
    }

    /// Feed raw bytes into the assembler.
    /// Returns any complete frames, in arrival order.
    pub fn push(&mut self, data: &[u8]) -> Vec<SerialFrame> {
        self.framer.feed(data)
    }

    /// Flush any remaining buffered data as an incomplete frame.
    /// Call when stream ends.
    pub fn flush(&mut self) -> Option<SerialFrame> {
        self.framer.flush()
    }

    /// Number of bytes waiting for a delimiter
    pub fn pending_len(&self) -> usize {
        self.framer.pending()
    }
}
