use std::{
    io::ErrorKind::{ConnectionRefused, ConnectionReset},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;
use tokio::{net::UdpSocket, sync::mpsc, time::sleep};

use crate::settings::Settings;

/// Sole writer for the context's udp socket.
///
/// Every outbound datagram, protocol or raw injection alike, funnels through
/// this task, which also applies the debug link simulation: packet loss,
/// fixed delay and a token-bucket bandwidth cap.
pub(crate) async fn run(
    socket: Arc<UdpSocket>,
    mut queue: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>,
    settings: Arc<RwLock<Settings>>,
) {
    let mut shaper = Shaper::default();

    while let Some((bytes, addr)) = queue.recv().await {
        let (delay, loss, bandwidth) = {
            let settings = settings.read();
            (
                settings.debug_delay,
                settings.debug_packet_loss,
                settings.debug_bandwidth,
            )
        };

        if loss > 0 {
            let dropped = { rand::rng().random_range(0..10_000) < loss };
            if dropped {
                log::trace!("udp send drop (simulated): size={}", bytes.len());
                continue;
            }
        }

        if !delay.is_zero() {
            sleep(delay).await;
        }

        if bandwidth > 0 {
            shaper.throttle(bytes.len(), bandwidth).await;
        }

        if let Err(e) = socket.send_to(&bytes, addr).await {
            // The remote host going away shows up as a reset or a refusal
            // depending on the platform; retransmission already covers it.
            if !matches!(e.kind(), ConnectionReset | ConnectionRefused) {
                log::warn!("udp socket send error: {:?}", e);
            }
        } else {
            log::trace!("udp socket send: size={}, addr={:?}", bytes.len(), addr);
        }
    }
}

/// Token bucket with millisecond granularity, tracked as a byte debt that
/// drains at the configured rate.
#[derive(Default)]
struct Shaper {
    debt: f64,
    updated: Option<Instant>,
}

impl Shaper {
    async fn throttle(&mut self, size: usize, bandwidth: u64) {
        // bits per second on the knob, bytes per second in here.
        let rate = bandwidth as f64 / 8.0;
        let now = Instant::now();

        if let Some(updated) = self.updated.replace(now) {
            self.debt -= now.duration_since(updated).as_secs_f64() * rate;
            if self.debt < 0.0 {
                self.debt = 0.0;
            }
        }

        self.debt += size as f64;

        // allow a millisecond worth of burst before sleeping the overrun.
        let over = self.debt - rate / 1_000.0;
        if over > 0.0 {
            sleep(Duration::from_secs_f64(over / rate)).await;
        }
    }
}
