use service::{ErrorKind, Observer as ServiceObserver};

use crate::statistics::{Monitor, Stats};

/// Routes the context's hooks into the log and the monitor counters.
pub struct Observer {
    monitor: Monitor,
}

impl Observer {
    pub fn new(monitor: Monitor) -> Self {
        Self { monitor }
    }
}

impl ServiceObserver for Observer {
    /// Datagrams that are not tunnel traffic end up here. The binary runs
    /// nothing else on the socket, so they are only counted and logged.
    fn on_unknown_packet(&self, bytes: &[u8]) {
        log::warn!("unknown udp packet: size={}", bytes.len());
        self.monitor.send(Stats::UnknownPacket);
    }

    fn on_error(&self, service: Option<&str>, kind: ErrorKind, message: &str) {
        log::error!(
            "forward error: service={:?}, kind={:?}, {}",
            service,
            kind,
            message
        );
        self.monitor.send(Stats::Failed);
    }

    fn on_established(&self, service: &str, session: u16) {
        log::info!("stream up: service={:?}, session={}", service, session);
        self.monitor.send(Stats::Established);
    }

    fn on_closed(&self, service: &str, session: u16) {
        log::info!("stream down: service={:?}, session={}", service, session);
        self.monitor.send(Stats::Closed);
    }
}
