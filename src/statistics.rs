use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use serde::Serialize;

/// The type of information passed into the monitor.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    Established,
    Closed,
    Failed,
    UnknownPacket,
}

#[derive(Default)]
struct Count(AtomicUsize);

impl Count {
    fn add(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Counts {
    established: Count,
    closed: Count,
    failed: Count,
    unknown_packets: Count,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub established: usize,
    pub closed: usize,
    pub failed: usize,
    pub unknown_packets: usize,
}

/// Context lifecycle counters.
///
/// Cheap to clone and update from anywhere; the observer feeds it, the
/// shutdown path and the dump output read it.
#[derive(Clone, Default)]
pub struct Monitor(Arc<Counts>);

impl Monitor {
    pub fn send(&self, stats: Stats) {
        match stats {
            Stats::Established => self.0.established.add(),
            Stats::Closed => self.0.closed.add(),
            Stats::Failed => self.0.failed.add(),
            Stats::UnknownPacket => self.0.unknown_packets.add(),
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            established: self.0.established.get(),
            closed: self.0.closed.get(),
            failed: self.0.failed.get(),
            unknown_packets: self.0.unknown_packets.get(),
        }
    }
}
