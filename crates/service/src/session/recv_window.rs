use std::collections::BTreeMap;

use bytes::Bytes;

/// What happened to an incoming segment.
pub(crate) enum Admit {
    /// In range, buffered (possibly completing an in-order run).
    Stored,
    /// Below the window, already delivered. The peer missed an ack.
    Duplicate,
    /// Beyond the window, dropped silently.
    OutOfRange,
}

/// Reassembly buffer for incoming segments.
///
/// Segments are keyed by sequence number; only sequences inside
/// [next, next + capacity) are admitted. `delivered` is the cumulative ack
/// value: the highest sequence handed to the local tcp socket in order.
pub(crate) struct RecvWindow {
    next: u32,
    buffered: BTreeMap<u32, Bytes>,
    capacity: usize,
}

impl RecvWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            // data sequences start at 1, 0 belongs to the connect exchange.
            next: 1,
            buffered: BTreeMap::new(),
            capacity,
        }
    }

    pub fn admit(&mut self, sequence: u32, payload: Bytes) -> Admit {
        if sequence < self.next {
            return Admit::Duplicate;
        }

        if sequence >= self.next + self.capacity as u32 {
            return Admit::OutOfRange;
        }

        self.buffered.insert(sequence, payload);
        Admit::Stored
    }

    /// The next in-order segment, if it has arrived.
    pub fn peek_ready(&self) -> Option<&Bytes> {
        self.buffered.get(&self.next)
    }

    /// Take the next in-order segment and advance the window edge.
    pub fn pop_ready(&mut self) -> Option<Bytes> {
        let payload = self.buffered.remove(&self.next)?;
        self.next = self.next.wrapping_add(1);
        Some(payload)
    }

    /// Highest sequence delivered in order, the cumulative ack value.
    pub fn delivered(&self) -> u32 {
        self.next - 1
    }

    /// Number of segments buffered out of order.
    pub fn pending(&self) -> usize {
        self.buffered.len()
    }
}
