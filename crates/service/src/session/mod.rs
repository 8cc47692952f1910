mod recv_window;
mod send_window;

pub(crate) use recv_window::{Admit, RecvWindow};
pub(crate) use send_window::{Expiry, SendWindow};

use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::tcp::Pipe;

/// How long a terminal session stays in the table.
///
/// Late packets arriving during this period are answered with a close
/// instead of being mistaken for a new session, and the session id cannot
/// be handed out again.
pub(crate) const LINGER: Duration = Duration::from_secs(3);

/// Fraction of the session timeout after which an idle sender emits a ping.
pub(crate) const KEEPALIVE_DIVISOR: u32 = 3;

pub(crate) enum State {
    /// Client side, connect request in flight. The accepted tcp stream is
    /// parked here until the peer acknowledges.
    Connecting { stream: Option<TcpStream> },
    /// Server side, backend tcp connect in flight.
    Opening,
    Established,
    /// Our close was sent, waiting for the peer's close or for silence.
    Closing { deadline: Instant },
    Failed { deadline: Instant },
    Closed { deadline: Instant },
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting { .. } => "connecting",
            Self::Opening => "opening",
            Self::Established => "established",
            Self::Closing { .. } => "closing",
            Self::Failed { .. } => "failed",
            Self::Closed { .. } => "closed",
        }
    }
}

/// One tcp stream carried over the udp socket.
///
/// All fields are owned by the reactor; the tcp socket itself is pumped by
/// the tasks behind `pipe`, which only ever talk back through the event
/// channel.
pub(crate) struct Session {
    pub id: u16,
    pub peer_id: u16,
    pub rule: u64,
    pub service: String,
    pub state: State,
    /// Window capacity, sampled from the settings when the session was
    /// created.
    pub window: usize,
    pub send: SendWindow,
    pub recv: RecvWindow,
    /// Next outbound data sequence. Starts at 1, 0 was the connect.
    pub next_sequence: u32,
    pub last_recv: Instant,
    pub last_send: Instant,
    pub pipe: Option<Pipe>,
    /// The local tcp read side reached eof, close once the window drains.
    pub local_eof: bool,
    /// The peer sent a close.
    pub remote_closed: bool,
    pub close_sent: bool,
    /// The owning rule was removed: already-buffered segments still flush
    /// into the local tcp socket, but fresh inbound data is turned away.
    pub refuse_new_data: bool,
}

impl Session {
    pub fn new(id: u16, rule: u64, service: String, window: usize, state: State) -> Self {
        let now = Instant::now();

        Self {
            id,
            peer_id: 0,
            rule,
            service,
            state,
            window,
            send: SendWindow::default(),
            recv: RecvWindow::new(window),
            next_sequence: 1,
            last_recv: now,
            last_send: now,
            pipe: None,
            local_eof: false,
            remote_closed: false,
            close_sent: false,
            refuse_new_data: false,
        }
    }

    /// Refresh the activity timestamp. Called for every packet received on
    /// the session.
    pub fn touch(&mut self) {
        self.last_recv = Instant::now();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, State::Failed { .. } | State::Closed { .. })
    }

    /// Whether the session should emit a close once its send window drains.
    pub fn wants_close(&self) -> bool {
        self.local_eof || self.remote_closed
    }
}
