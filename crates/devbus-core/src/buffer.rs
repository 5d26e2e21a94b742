//! Bounded in-memory trace buffer.
//!
//! The broker appends every dispatched command (request and response) here,
//! and clients keep one for everything they send, which makes recent traffic
//! replayable for diagnostics. The buffer is FIFO-bounded: once full, each
//! insert evicts the oldest entry. Contents are never persisted.

use std::collections::VecDeque;

use crate::protocol::envelope::Envelope;

/// A bounded FIFO log of recent envelopes.
///
/// Not internally synchronized; owners that share it across tasks wrap it in
/// a mutex, the same way the broker wraps its other runtime state.
#[derive(Debug)]
pub struct TraceBuffer {
    entries: VecDeque<Envelope>,
    capacity: usize,
}

impl TraceBuffer {
    /// Creates a buffer holding at most `capacity` envelopes.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Appends an envelope, evicting the oldest entry when full.
    pub fn append(&mut self, envelope: Envelope) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(envelope);
    }

    /// Returns the last `n` envelopes in arrival order (newest last).
    pub fn recent(&self, n: usize) -> Vec<Envelope> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Number of envelopes currently buffered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing has been buffered (or everything was evicted).
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The configured maximum.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
