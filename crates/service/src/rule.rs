use std::net::SocketAddr;

use ahash::AHashMap;
use tokio::task::JoinHandle;

/// Which half of the tunnel a rule serves.
///
/// A client rule listens on a local tcp port and tunnels every accepted
/// connection to the peer; a server rule answers tunneled connects for its
/// service by dialing the configured backend address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleMode {
    Client,
    Server,
}

pub(crate) struct RuleEntry {
    pub id: u64,
    pub mode: RuleMode,
    pub service: String,
    /// Backend address for server rules, requested listen address for
    /// client rules.
    pub address: SocketAddr,
    /// Actually bound listen address for client rules.
    pub listen: Option<SocketAddr>,
    pub listener: Option<JoinHandle<()>>,
}

/// Rules of one context, keyed by their handle id.
///
/// Service names are unique per mode; lookups by (mode, service) happen on
/// every connect packet, lookups by id on every accept.
#[derive(Default)]
pub(crate) struct RuleTable {
    entries: AHashMap<u64, RuleEntry>,
    next_id: u64,
}

impl RuleTable {
    pub fn insert(
        &mut self,
        mode: RuleMode,
        service: String,
        address: SocketAddr,
        listen: Option<SocketAddr>,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(
            id,
            RuleEntry {
                id,
                mode,
                service,
                address,
                listen,
                listener: None,
            },
        );

        id
    }

    pub fn remove(&mut self, id: u64) -> Option<RuleEntry> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<&RuleEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut RuleEntry> {
        self.entries.get_mut(&id)
    }

    pub fn find(&self, mode: RuleMode, service: &str) -> Option<&RuleEntry> {
        self.entries
            .values()
            .find(|entry| entry.mode == mode && entry.service == service)
    }

    pub fn contains(&self, mode: RuleMode, service: &str) -> bool {
        self.find(mode, service).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleEntry> {
        self.entries.values()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = RuleEntry> + '_ {
        self.entries.drain().map(|(_, entry)| entry)
    }
}
