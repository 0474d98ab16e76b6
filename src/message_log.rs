// src/message_log.rs
//
// Ordered, append-only log of sent and received messages.
// Fed from the session controller's Message events. Records are never
// edited; the only removal is clear(). Re-rendering in another display
// encoding produces a new string and leaves the stored record untouched.

use serde::Serialize;
use std::sync::RwLock;

use crate::io::{decode, Direction, Encoding, MessageRecord};

// ============================================================================
// Types
// ============================================================================

/// Counters over the records currently in the log
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub sent_count: usize,
    pub received_count: usize,
    pub bytes_sent: usize,
    pub bytes_received: usize,
}

#[derive(Default)]
struct LogInner {
    records: Vec<MessageRecord>,
    stats: LogStats,
}

#[derive(Default)]
pub struct MessageLog {
    inner: RwLock<LogInner>,
}

// ============================================================================
// Public API
// ============================================================================

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Records with an id already in the log are ignored.
    pub fn append(&self, record: MessageRecord) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.records.iter().any(|r| r.id == record.id) {
            return false;
        }
        match record.direction {
            Direction::Sent => {
                inner.stats.sent_count += 1;
                inner.stats.bytes_sent += record.raw_bytes.len();
            }
            Direction::Received => {
                inner.stats.received_count += 1;
                inner.stats.bytes_received += record.raw_bytes.len();
            }
        }
        inner.records.push(record);
        true
    }

    /// All records, oldest first
    pub fn records(&self) -> Vec<MessageRecord> {
        self.read(|inner| inner.records.clone())
    }

    pub fn len(&self) -> usize {
        self.read(|inner| inner.records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<MessageRecord> {
        self.read(|inner| inner.records.iter().find(|r| r.id == id).cloned())
    }

    /// Record at a position in the log (0 = oldest)
    pub fn nth(&self, index: usize) -> Option<MessageRecord> {
        self.read(|inner| inner.records.get(index).cloned())
    }

    /// Last `count` records, oldest first
    pub fn tail(&self, count: usize) -> Vec<MessageRecord> {
        self.read(|inner| {
            let start = inner.records.len().saturating_sub(count);
            inner.records[start..].to_vec()
        })
    }

    /// Remove every record and reset the counters
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let cleared = inner.records.len();
        inner.records.clear();
        inner.stats = LogStats::default();
        tlog!("[log] Cleared {} message(s)", cleared);
    }

    /// Render a stored record's bytes in another display encoding
    pub fn render_as(&self, id: &str, encoding: Encoding) -> Option<String> {
        self.read(|inner| {
            inner
                .records
                .iter()
                .find(|r| r.id == id)
                .map(|r| decode(&r.raw_bytes, encoding))
        })
    }

    /// Original input and encoding of a sent record, for resending
    pub fn resend_input(&self, id: &str) -> Option<(String, Encoding)> {
        self.read(|inner| {
            inner
                .records
                .iter()
                .find(|r| r.id == id)
                .and_then(|r| r.original_input.clone().map(|input| (input, r.encoding)))
        })
    }

    pub fn stats(&self) -> LogStats {
        self.read(|inner| inner.stats)
    }

    pub fn bytes_sent(&self) -> usize {
        self.stats().bytes_sent
    }

    pub fn bytes_received(&self) -> usize {
        self.stats().bytes_received
    }

    fn read<T>(&self, f: impl FnOnce(&LogInner) -> T) -> T {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&inner)
    }
}
