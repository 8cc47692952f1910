use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::sync::OwnedSemaphorePermit;

/// One unacknowledged outbound segment.
///
/// The encoded wire packet is kept around so a retransmission is a plain
/// resend of identical bytes. The window permit, if any, is returned to the
/// session's reader once the segment leaves the window, which resumes the
/// local tcp read side.
pub(crate) struct Segment {
    pub sequence: u32,
    pub packet: Bytes,
    pub deadline: Instant,
    pub retries: u32,
    _permit: Option<OwnedSemaphorePermit>,
}

/// Outcome of one retransmission sweep.
pub(crate) enum Expiry {
    /// Packets to put back on the wire.
    Resend(Vec<Bytes>),
    /// A segment ran out of retries, the session is lost.
    Exhausted,
}

/// The set of unacknowledged outbound segments, ordered by sequence number.
///
/// Capacity is enforced upstream by the reader permits, so segments arrive
/// here at most window-size at a time plus the connect segment.
#[derive(Default)]
pub(crate) struct SendWindow {
    segments: VecDeque<Segment>,
}

impl SendWindow {
    pub fn push(
        &mut self,
        sequence: u32,
        packet: Bytes,
        deadline: Instant,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        debug_assert!(
            self.segments
                .back()
                .map(|segment| segment.sequence < sequence)
                .unwrap_or(true)
        );

        self.segments.push_back(Segment {
            sequence,
            packet,
            deadline,
            retries: 0,
            _permit: permit,
        });
    }

    /// Apply a cumulative acknowledgment, releasing every segment with a
    /// sequence number up to and including the given one.
    pub fn ack(&mut self, sequence: u32) -> usize {
        let mut released = 0;
        while let Some(front) = self.segments.front() {
            if front.sequence > sequence {
                break;
            }

            self.segments.pop_front();
            released += 1;
        }

        released
    }

    /// Sweep the window for segments whose retransmit deadline has passed.
    ///
    /// Every due segment has its retry counter bumped and its timer
    /// re-armed; a segment going past the retry budget aborts the sweep.
    pub fn expire(&mut self, now: Instant, timeout: Duration, retries: u32) -> Expiry {
        let mut resend = Vec::new();
        for segment in self.segments.iter_mut() {
            if segment.deadline > now {
                continue;
            }

            segment.retries += 1;
            if segment.retries > retries {
                return Expiry::Exhausted;
            }

            segment.deadline = now + timeout;
            resend.push(segment.packet.clone());
        }

        Expiry::Resend(resend)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Lowest and highest buffered sequence numbers.
    pub fn range(&self) -> Option<(u32, u32)> {
        Some((
            self.segments.front()?.sequence,
            self.segments.back()?.sequence,
        ))
    }
}
