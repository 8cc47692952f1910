use std::{
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use codec::{FailReason, MAX_PAYLOAD_SIZE, MAX_SERVICE_SIZE, Packet, PacketType};
use parking_lot::RwLock;
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{OwnedSemaphorePermit, mpsc},
    time::{MissedTickBehavior, interval},
};

use crate::{
    ErrorKind, Observer,
    context::{Command, ContextDump, RuleDump, RuleError, SessionDump},
    rule::{RuleMode, RuleTable},
    session::{Admit, Expiry, KEEPALIVE_DIVISOR, LINGER, Session, State},
    settings::Settings,
    tcp::{self, Pipe},
};

/// Timer resolution of the reactor. Retransmit and expiry deadlines are
/// checked at this granularity.
const TICK: Duration = Duration::from_millis(20);

/// Notifications from the tcp pump tasks back into the reactor.
pub(crate) enum Event {
    /// A client rule's listener accepted a connection.
    Accepted { rule: u64, stream: TcpStream },
    /// A server side backend connect finished.
    Opened {
        id: u16,
        result: io::Result<TcpStream>,
    },
    /// The local tcp socket produced one segment worth of bytes. The permit
    /// is the window slot the segment occupies until it is acknowledged.
    StreamData {
        id: u16,
        bytes: Bytes,
        permit: OwnedSemaphorePermit,
    },
    /// The local tcp read side reached eof or errored.
    StreamEof { id: u16 },
    /// The local tcp write side failed, the stream is unusable.
    StreamBroken { id: u16 },
}

enum Finish {
    /// Transport failure, reported through the error hook.
    Failed(ErrorKind),
    /// Failure that is not reported (peer reset, context teardown).
    Aborted,
    /// Orderly shutdown.
    Closed,
}

/// Single task owning every piece of mutable state of one context.
///
/// All session and rule mutation happens here; public api calls arrive on
/// the command channel, socket pumps report on the event channel, and a
/// coarse tick drives the timers. Nothing in here blocks.
pub(crate) struct Reactor<T> {
    socket: Arc<UdpSocket>,
    observer: Arc<T>,
    settings: Arc<RwLock<Settings>>,
    peer: Arc<RwLock<Option<SocketAddr>>>,
    outgoing: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    events: mpsc::UnboundedSender<Event>,
    rules: RuleTable,
    sessions: AHashMap<u16, Session>,
    /// Ids of recycled sessions and the instant they become allocatable
    /// again. An id sits here for a quiet period of `session_timeout` after
    /// its table entry is dropped, so a slow peer that still considers the
    /// old session live can never collide with a new one.
    recycled: AHashMap<u16, Instant>,
    next_session: u16,
    scratch: BytesMut,
    socket_dead: bool,
}

pub(crate) async fn run<T: Observer>(
    mut reactor: Reactor<T>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::UnboundedReceiver<Event>,
) {
    let socket = reactor.socket.clone();
    let mut buf = vec![0u8; 4096];
    let mut tick = interval(TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf), if !reactor.socket_dead => match result {
                Ok((size, addr)) => reactor.on_datagram(&buf[..size], addr),
                Err(e) => reactor.on_socket_error(e),
            },
            command = commands.recv() => match command {
                // Dropping the last context handle tears the reactor down
                // just like an explicit shutdown.
                Some(Command::Shutdown) | None => break,
                Some(command) => reactor.on_command(command),
            },
            Some(event) = events.recv() => reactor.on_event(event),
            _ = tick.tick() => reactor.on_tick(),
        }
    }

    reactor.teardown();
}

impl<T: Observer> Reactor<T> {
    pub fn new(
        socket: Arc<UdpSocket>,
        observer: Arc<T>,
        settings: Arc<RwLock<Settings>>,
        peer: Arc<RwLock<Option<SocketAddr>>>,
        outgoing: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            socket,
            observer,
            settings,
            peer,
            outgoing,
            events,
            rules: RuleTable::default(),
            sessions: AHashMap::new(),
            recycled: AHashMap::new(),
            next_session: 0,
            scratch: BytesMut::with_capacity(4096),
            socket_dead: false,
        }
    }

    /// Encode one packet and hand it to the udp sender. Returns the encoded
    /// bytes so data segments can be parked in the send window for
    /// retransmission.
    fn send_packet(
        &mut self,
        kind: PacketType,
        session: u16,
        peer_session: u16,
        sequence: u32,
        payload: &[u8],
    ) -> Option<Bytes> {
        let peer = (*self.peer.read())?;
        let packet = Packet {
            kind,
            session,
            peer_session,
            sequence,
            payload,
        };

        packet.encode(&mut self.scratch).ok()?;
        let bytes = self.scratch.split().freeze();

        log::trace!(
            "udp packet send: kind={:?}, session={}, peer_session={}, seq={}, size={}",
            kind,
            session,
            peer_session,
            sequence,
            bytes.len()
        );

        let _ = self.outgoing.send((bytes.clone(), peer));
        Some(bytes)
    }

    /// Put already-encoded bytes back on the wire (retransmission).
    fn transmit(&mut self, bytes: Bytes) {
        if let Some(peer) = *self.peer.read() {
            let _ = self.outgoing.send((bytes, peer));
        }
    }

    fn alloc_session_id(&mut self) -> Option<u16> {
        // ids stay unavailable while a session lives in the table or sits
        // out its post-recycle quiet period, and the monotonic sweep keeps
        // reuse far apart in time on top of that.
        for _ in 0..u16::MAX {
            self.next_session = self.next_session.wrapping_add(1);
            if self.next_session == 0 {
                continue;
            }

            if !self.sessions.contains_key(&self.next_session)
                && !self.recycled.contains_key(&self.next_session)
            {
                return Some(self.next_session);
            }
        }

        None
    }

    fn on_datagram(&mut self, data: &[u8], addr: SocketAddr) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) if e.is_foreign() => {
                log::trace!(
                    "unknown udp datagram: size={}, addr={:?}, err={:?}",
                    data.len(),
                    addr,
                    e
                );
                self.observer.on_unknown_packet(data);
                return;
            }
            Err(e) => {
                log::trace!(
                    "malformed packet dropped: size={}, addr={:?}, err={:?}",
                    data.len(),
                    addr,
                    e
                );
                return;
            }
        };

        // the peer may move between addresses (re-punched nat); replies
        // always go to where we last heard it.
        *self.peer.write() = Some(addr);

        log::trace!(
            "udp packet receive: kind={:?}, session={}, peer_session={}, seq={}, size={}",
            packet.kind,
            packet.session,
            packet.peer_session,
            packet.sequence,
            packet.payload.len()
        );

        match packet.kind {
            PacketType::Connect => self.on_connect(&packet),
            PacketType::ConnectAck => self.on_connect_ack(&packet),
            PacketType::ConnectFail => self.on_connect_fail(&packet),
            PacketType::Data => self.on_data(&packet),
            PacketType::Ack => self.on_ack(&packet),
            PacketType::Close => self.on_close(&packet),
            PacketType::Ping => self.on_ping(&packet),
        }
    }

    fn on_connect(&mut self, packet: &Packet) {
        let service = match packet.service() {
            Ok(name) if !name.is_empty() && name.len() <= MAX_SERVICE_SIZE => name.to_string(),
            _ => {
                log::warn!("connect with invalid service name: peer={}", packet.session);
                return;
            }
        };

        // session id 0 means "not assigned"; a connect must carry the real
        // id the peer allocated, anything else is malformed.
        if packet.session == 0 {
            log::warn!("connect without a session id: service={:?}", service);
            return;
        }

        enum Dup {
            Ack { id: u16, peer: u16 },
            Wait,
            No,
        }

        // A connect referencing a peer session we already track is a
        // retransmit, not a new stream. Sessions that have not learned
        // their peer id yet (client side, still connecting) never match.
        let dup = {
            match self.sessions.values_mut().find(|session| {
                session.peer_id != 0
                    && session.peer_id == packet.session
                    && !session.is_terminal()
            }) {
                Some(session) => {
                    session.touch();
                    if matches!(session.state, State::Established | State::Closing { .. }) {
                        Dup::Ack {
                            id: session.id,
                            peer: session.peer_id,
                        }
                    } else {
                        Dup::Wait
                    }
                }
                None => Dup::No,
            }
        };

        match dup {
            Dup::Ack { id, peer } => {
                self.send_packet(PacketType::ConnectAck, id, peer, 0, &[]);
                return;
            }
            // backend connect still in flight, the ack follows once it
            // lands.
            Dup::Wait => return,
            Dup::No => {}
        }

        let Some((rule, address)) = self
            .rules
            .find(RuleMode::Server, &service)
            .map(|rule| (rule.id, rule.address))
        else {
            log::warn!("connect for unknown service: service={:?}", service);
            self.send_packet(
                PacketType::ConnectFail,
                0,
                packet.session,
                0,
                &[FailReason::UnknownService.into()],
            );
            return;
        };

        let Some(id) = self.alloc_session_id() else {
            log::warn!("session table full, refusing connect: service={:?}", service);
            self.send_packet(
                PacketType::ConnectFail,
                0,
                packet.session,
                0,
                &[FailReason::ConnectRefused.into()],
            );
            return;
        };

        let window = self.settings.read().slide_window;
        let mut session = Session::new(id, rule, service.clone(), window, State::Opening);
        session.peer_id = packet.session;
        self.sessions.insert(id, session);
        tcp::spawn_connector(id, address, self.events.clone());

        log::info!(
            "session opening: service={:?}, session={}, peer={}",
            service,
            id,
            packet.session
        );
    }

    fn on_connect_ack(&mut self, packet: &Packet) {
        let id = packet.peer_session;
        let (stream, window, service) = {
            let Some(session) = self.sessions.get_mut(&id) else {
                return;
            };

            session.touch();
            let State::Connecting { stream } = &mut session.state else {
                // duplicate ack for an established session.
                return;
            };

            let Some(stream) = stream.take() else {
                return;
            };

            session.peer_id = packet.session;
            session.send.ack(0);
            session.state = State::Established;
            (stream, session.window, session.service.clone())
        };

        let pipe = Pipe::spawn(id, stream, window, MAX_PAYLOAD_SIZE, self.events.clone());
        if let Some(session) = self.sessions.get_mut(&id) {
            session.pipe = Some(pipe);
        }

        log::info!(
            "session established: service={:?}, session={}, peer={}",
            service,
            id,
            packet.session
        );
        self.observer.on_established(&service, id);
    }

    fn on_connect_fail(&mut self, packet: &Packet) {
        let id = packet.peer_session;
        let reason = {
            let Some(session) = self.sessions.get_mut(&id) else {
                return;
            };

            if !matches!(session.state, State::Connecting { .. }) {
                return;
            }

            session.touch();
            packet.fail_reason()
        };

        let kind = match reason {
            Some(FailReason::UnknownService) => ErrorKind::UnknownService,
            _ => ErrorKind::ConnectFailed,
        };

        self.terminate(id, Finish::Failed(kind), "connect rejected by peer");
    }

    fn on_data(&mut self, packet: &Packet) {
        let id = packet.peer_session;

        enum Action {
            Reset { session: u16, peer: u16 },
            Ack,
            Drop,
        }

        let action = match self.sessions.get_mut(&id) {
            // stateless reset: this side no longer knows the session.
            None => Action::Reset {
                session: 0,
                peer: packet.session,
            },
            Some(session) if session.is_terminal() => Action::Reset {
                session: session.id,
                peer: session.peer_id,
            },
            // a session whose rule is gone refuses fresh data outright; the
            // close tells the peer to stop instead of retransmitting into
            // a window that will never be acknowledged.
            Some(session) if session.refuse_new_data => Action::Reset {
                session: session.id,
                peer: session.peer_id,
            },
            Some(session) => {
                session.touch();
                let payload = Bytes::copy_from_slice(packet.payload);
                match session.recv.admit(packet.sequence, payload) {
                    Admit::OutOfRange => Action::Drop,
                    Admit::Stored | Admit::Duplicate => Action::Ack,
                }
            }
        };

        match action {
            Action::Reset { session, peer } => {
                log::trace!("data for unknown session: peer={}", packet.session);
                self.send_packet(PacketType::Close, session, peer, 0, &[]);
            }
            Action::Drop => {}
            Action::Ack => {
                self.flush_session(id);
                let Some(session) = self.sessions.get_mut(&id) else {
                    return;
                };

                session.last_send = Instant::now();
                let (sid, peer, delivered) =
                    (session.id, session.peer_id, session.recv.delivered());
                self.send_packet(PacketType::Ack, sid, peer, delivered, &[]);
            }
        }
    }

    fn on_ack(&mut self, packet: &Packet) {
        let id = packet.peer_session;
        {
            let Some(session) = self.sessions.get_mut(&id) else {
                return;
            };

            if session.is_terminal() {
                return;
            }

            session.touch();
            session.send.ack(packet.sequence);
        }

        self.maybe_send_close(id);
    }

    fn on_close(&mut self, packet: &Packet) {
        let id = packet.peer_session;

        enum Action {
            Reset,
            Drain,
            Finish,
            Ignore,
        }

        let action = {
            let Some(session) = self.sessions.get_mut(&id) else {
                return;
            };

            session.touch();
            match session.state {
                State::Connecting { .. } | State::Opening => Action::Reset,
                State::Established => {
                    session.remote_closed = true;
                    if let Some(pipe) = &session.pipe {
                        pipe.stop_reader();
                    }
                    Action::Drain
                }
                State::Closing { .. } => {
                    session.remote_closed = true;
                    Action::Finish
                }
                State::Failed { .. } | State::Closed { .. } => Action::Ignore,
            }
        };

        match action {
            Action::Reset => {
                log::warn!("session reset by peer: session={}", id);
                self.terminate(id, Finish::Aborted, "reset by peer");
            }
            Action::Drain => {
                self.flush_session(id);
                self.maybe_send_close(id);
            }
            Action::Finish => {
                self.flush_session(id);
                self.terminate(id, Finish::Closed, "session closed");
            }
            Action::Ignore => {}
        }
    }

    fn on_ping(&mut self, packet: &Packet) {
        let id = packet.peer_session;
        let reply = {
            let Some(session) = self.sessions.get_mut(&id) else {
                return;
            };

            if session.is_terminal() {
                return;
            }

            session.touch();
            session.last_send = Instant::now();
            (session.id, session.peer_id, session.recv.delivered())
        };

        self.send_packet(PacketType::Ack, reply.0, reply.1, reply.2, &[]);
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Accepted { rule, stream } => self.on_accepted(rule, stream),
            Event::Opened { id, result } => self.on_opened(id, result),
            Event::StreamData { id, bytes, permit } => self.on_stream_data(id, bytes, permit),
            Event::StreamEof { id } => self.on_stream_eof(id),
            Event::StreamBroken { id } => self.on_stream_broken(id),
        }
    }

    fn on_accepted(&mut self, rule: u64, stream: TcpStream) {
        let Some(service) = self.rules.get(rule).map(|entry| entry.service.clone()) else {
            // rule removed between accept and dispatch, refuse the socket.
            return;
        };

        let Some(id) = self.alloc_session_id() else {
            log::warn!("session table full, refusing accept: service={:?}", service);
            return;
        };

        let now = Instant::now();
        let (window, timeout) = {
            let settings = self.settings.read();
            (settings.slide_window, settings.udp_timeout)
        };

        self.sessions.insert(
            id,
            Session::new(
                id,
                rule,
                service.clone(),
                window,
                State::Connecting {
                    stream: Some(stream),
                },
            ),
        );

        // the connect travels through the send window like any segment, so
        // the retransmit machinery covers the handshake as well.
        let Some(packet) = self.send_packet(PacketType::Connect, id, 0, 0, service.as_bytes())
        else {
            log::warn!("no peer address yet, refusing accept: service={:?}", service);
            self.sessions.remove(&id);
            return;
        };

        if let Some(session) = self.sessions.get_mut(&id) {
            session.send.push(0, packet, now + timeout, None);
            session.last_send = now;
        }

        log::info!("session connecting: service={:?}, session={}", service, id);
    }

    fn on_opened(&mut self, id: u16, result: io::Result<TcpStream>) {
        match result {
            Ok(stream) => {
                let (window, service, peer) = {
                    let Some(session) = self.sessions.get_mut(&id) else {
                        return;
                    };

                    if !matches!(session.state, State::Opening) {
                        return;
                    }

                    session.state = State::Established;
                    session.last_send = Instant::now();
                    (session.window, session.service.clone(), session.peer_id)
                };

                let pipe = Pipe::spawn(id, stream, window, MAX_PAYLOAD_SIZE, self.events.clone());
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.pipe = Some(pipe);
                }

                self.send_packet(PacketType::ConnectAck, id, peer, 0, &[]);
                log::info!(
                    "session established: service={:?}, session={}, peer={}",
                    service,
                    id,
                    peer
                );
                self.observer.on_established(&service, id);

                // deliver anything that raced ahead of the backend connect.
                if self.flush_session(id) {
                    self.ack_now(id);
                }
            }
            Err(e) => {
                let (service, peer) = {
                    let Some(session) = self.sessions.get(&id) else {
                        return;
                    };

                    if !matches!(session.state, State::Opening) {
                        return;
                    }

                    (session.service.clone(), session.peer_id)
                };

                self.send_packet(
                    PacketType::ConnectFail,
                    id,
                    peer,
                    0,
                    &[FailReason::ConnectRefused.into()],
                );
                log::warn!("backend connect failed: service={:?}, err={:?}", service, e);
                self.observer
                    .on_error(Some(&service), ErrorKind::ConnectFailed, &e.to_string());

                // the nascent session is destroyed outright; a retransmitted
                // connect simply retries the backend.
                self.sessions.remove(&id);
            }
        }
    }

    fn on_stream_data(&mut self, id: u16, bytes: Bytes, permit: OwnedSemaphorePermit) {
        let now = Instant::now();
        let timeout = self.settings.read().udp_timeout;

        let (sequence, sid, peer) = {
            let Some(session) = self.sessions.get_mut(&id) else {
                return;
            };

            if !matches!(session.state, State::Established) {
                return;
            }

            let sequence = session.next_sequence;
            session.next_sequence = sequence.wrapping_add(1);
            session.last_send = now;
            (sequence, session.id, session.peer_id)
        };

        let Some(packet) = self.send_packet(PacketType::Data, sid, peer, sequence, &bytes) else {
            return;
        };

        if let Some(session) = self.sessions.get_mut(&id) {
            session.send.push(sequence, packet, now + timeout, Some(permit));
        }
    }

    fn on_stream_eof(&mut self, id: u16) {
        {
            let Some(session) = self.sessions.get_mut(&id) else {
                return;
            };

            if !matches!(session.state, State::Established) {
                return;
            }

            session.local_eof = true;
        }

        log::debug!("local tcp eof: session={}", id);
        self.maybe_send_close(id);
    }

    fn on_stream_broken(&mut self, id: u16) {
        let close = {
            let Some(session) = self.sessions.get_mut(&id) else {
                return;
            };

            if session.is_terminal() {
                return;
            }

            session.close_sent = true;
            let sequence = session.next_sequence;
            session.next_sequence = sequence.wrapping_add(1);
            (session.id, session.peer_id, sequence)
        };

        log::warn!("local tcp write failed: session={}", id);
        // hard abort: the close goes out right away, the window be damned.
        self.send_packet(PacketType::Close, close.0, close.1, close.2, &[]);
        self.terminate(id, Finish::Closed, "local tcp write failed");
    }

    /// Deliver in-order segments into the session's writer queue. Returns
    /// whether any segment went through, which calls for a fresh ack.
    fn flush_session(&mut self, id: u16) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };

        let mut progressed = false;
        if let Some(pipe) = &session.pipe {
            while let Some(bytes) = session.recv.peek_ready().cloned() {
                if !pipe.try_write(bytes) {
                    break;
                }

                session.recv.pop_ready();
                progressed = true;
            }
        }

        // after a remote close nothing else can arrive; once the in-order
        // run is flushed the writer drains its queue and sends a fin.
        if session.remote_closed && session.recv.peek_ready().is_none() {
            if let Some(pipe) = &mut session.pipe {
                if !pipe.writer_closed() {
                    pipe.close_writer();
                }
            }
        }

        progressed
    }

    /// Emit a cumulative ack for the session's current delivery edge.
    fn ack_now(&mut self, id: u16) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };

        session.last_send = Instant::now();
        let (sid, peer, delivered) = (session.id, session.peer_id, session.recv.delivered());
        self.send_packet(PacketType::Ack, sid, peer, delivered, &[]);
    }

    /// Emit our close once the send window has drained, then finish the
    /// session if the peer's close was already seen.
    fn maybe_send_close(&mut self, id: u16) {
        let now = Instant::now();
        let (close, finish) = {
            let Some(session) = self.sessions.get_mut(&id) else {
                return;
            };

            if !matches!(session.state, State::Established)
                || session.close_sent
                || !session.wants_close()
                || !session.send.is_empty()
            {
                return;
            }

            session.close_sent = true;
            let sequence = session.next_sequence;
            session.next_sequence = sequence.wrapping_add(1);
            session.last_send = now;
            session.state = State::Closing {
                deadline: now + LINGER,
            };
            ((session.id, session.peer_id, sequence), session.remote_closed)
        };

        self.send_packet(PacketType::Close, close.0, close.1, close.2, &[]);
        if finish {
            self.terminate(id, Finish::Closed, "session closed");
        }
    }

    /// Close a session the way a local eof would: stop reading, drain the
    /// window, then say goodbye. Nascent sessions are dropped with a reset.
    fn close_local(&mut self, id: u16, reason: &str) {
        enum Action {
            Graceful,
            Reset { session: u16, peer: u16 },
            Ignore,
        }

        let action = {
            let Some(session) = self.sessions.get_mut(&id) else {
                return;
            };

            match session.state {
                State::Established => {
                    session.local_eof = true;
                    if let Some(pipe) = &session.pipe {
                        pipe.stop_reader();
                    }
                    Action::Graceful
                }
                State::Connecting { .. } | State::Opening => Action::Reset {
                    session: session.id,
                    peer: session.peer_id,
                },
                _ => Action::Ignore,
            }
        };

        match action {
            Action::Graceful => self.maybe_send_close(id),
            Action::Reset { session, peer } => {
                if peer != 0 {
                    self.send_packet(PacketType::Close, session, peer, 0, &[]);
                }
                self.terminate(id, Finish::Aborted, reason);
            }
            Action::Ignore => {}
        }
    }

    /// Move a session into a terminal state and detach it from its tcp
    /// socket. The entry lingers in the table so late packets are answered
    /// with a close and the id is not reused right away.
    fn terminate(&mut self, id: u16, finish: Finish, message: &str) {
        let now = Instant::now();
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };

        if session.is_terminal() {
            return;
        }

        let service = session.service.clone();
        match finish {
            Finish::Failed(kind) => {
                session.state = State::Failed {
                    deadline: now + LINGER,
                };
                if let Some(pipe) = &session.pipe {
                    pipe.abort();
                }

                log::warn!(
                    "session failed: service={:?}, session={}, {}",
                    service,
                    id,
                    message
                );
                self.observer.on_error(Some(&service), kind, message);
            }
            Finish::Aborted => {
                session.state = State::Failed {
                    deadline: now + LINGER,
                };
                if let Some(pipe) = &session.pipe {
                    pipe.abort();
                }

                log::debug!(
                    "session aborted: service={:?}, session={}, {}",
                    service,
                    id,
                    message
                );
            }
            Finish::Closed => {
                session.state = State::Closed {
                    deadline: now + LINGER,
                };
                if let Some(pipe) = &mut session.pipe {
                    pipe.stop_reader();
                    pipe.close_writer();
                }

                log::info!("session closed: service={:?}, session={}", service, id);
                self.observer.on_closed(&service, id);
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let settings = *self.settings.read();

        // ids whose quiet period has elapsed go back into circulation.
        self.recycled.retain(|_, quiet_until| now < *quiet_until);

        let ids: Vec<u16> = self.sessions.keys().copied().collect();

        for id in ids {
            enum Step {
                Recycle,
                CloseTimeout,
                Run,
            }

            let step = {
                let Some(session) = self.sessions.get(&id) else {
                    continue;
                };

                match session.state {
                    State::Failed { deadline } | State::Closed { deadline } => {
                        if now >= deadline {
                            Step::Recycle
                        } else {
                            continue;
                        }
                    }
                    // the peer stayed silent past the linger window, take
                    // that as the acknowledgment.
                    State::Closing { deadline } if now >= deadline => Step::CloseTimeout,
                    _ => Step::Run,
                }
            };

            match step {
                Step::Recycle => {
                    self.sessions.remove(&id);
                    // the short table linger only covers answering late
                    // packets; the id itself stays reserved until a stale
                    // peer would have expired the session on its side.
                    self.recycled.insert(id, now + settings.session_timeout);
                    log::trace!("session recycled: session={}", id);
                    continue;
                }
                Step::CloseTimeout => {
                    self.terminate(id, Finish::Closed, "close linger elapsed");
                    continue;
                }
                Step::Run => {}
            }

            // retransmission sweep.
            let expiry = {
                let Some(session) = self.sessions.get_mut(&id) else {
                    continue;
                };

                session
                    .send
                    .expire(now, settings.udp_timeout, settings.udp_retries)
            };

            match expiry {
                Expiry::Exhausted => {
                    self.terminate(
                        id,
                        Finish::Failed(ErrorKind::RetryExhausted),
                        "udp retries exhausted",
                    );
                    continue;
                }
                Expiry::Resend(packets) => {
                    for bytes in packets {
                        log::trace!("retransmit: session={}, size={}", id, bytes.len());
                        self.transmit(bytes);
                    }
                }
            }

            // retry deliveries that stalled on a full writer queue.
            if self.flush_session(id) {
                self.ack_now(id);
            }

            self.maybe_send_close(id);

            enum Idle {
                Expire,
                Ping { session: u16, peer: u16, sequence: u32 },
                None,
            }

            let idle = {
                let Some(session) = self.sessions.get_mut(&id) else {
                    continue;
                };

                if session.is_terminal() {
                    continue;
                }

                if now.duration_since(session.last_recv) >= settings.session_timeout {
                    Idle::Expire
                } else if matches!(session.state, State::Established)
                    && now.duration_since(session.last_send)
                        >= settings.session_timeout / KEEPALIVE_DIVISOR
                {
                    session.last_send = now;
                    Idle::Ping {
                        session: session.id,
                        peer: session.peer_id,
                        sequence: session.next_sequence.wrapping_sub(1),
                    }
                } else {
                    Idle::None
                }
            };

            match idle {
                Idle::Expire => {
                    log::info!("session expired: session={}", id);
                    self.close_local(id, "session timed out");
                }
                Idle::Ping {
                    session,
                    peer,
                    sequence,
                } => {
                    self.send_packet(PacketType::Ping, session, peer, sequence, &[]);
                }
                Idle::None => {}
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::AddRule {
                mode,
                service,
                address,
                done,
            } => {
                let _ = done.send(self.add_rule(mode, service, address));
            }
            Command::DelRule { id } => self.del_rule(id),
            Command::Dump { done } => {
                let _ = done.send(self.dump());
            }
            Command::Shutdown => {}
        }
    }

    fn add_rule(
        &mut self,
        mode: RuleMode,
        service: String,
        address: SocketAddr,
    ) -> Result<(u64, Option<SocketAddr>), RuleError> {
        if service.is_empty() || service.len() > MAX_SERVICE_SIZE {
            self.observer.on_error(
                None,
                ErrorKind::InvalidService,
                "service name must be 1..=255 bytes",
            );
            return Err(RuleError::InvalidService);
        }

        if self.rules.contains(mode, &service) {
            self.observer.on_error(
                Some(&service),
                ErrorKind::DuplicateRule,
                "a rule with this mode and service already exists",
            );
            return Err(RuleError::DuplicateRule);
        }

        let mut listen = None;
        let mut listener = None;
        if mode == RuleMode::Client {
            // bind through std so the reactor never awaits; the listener is
            // handed to tokio already non-blocking.
            let bound = std::net::TcpListener::bind(address).and_then(|socket| {
                socket.set_nonblocking(true)?;
                TcpListener::from_std(socket)
            });

            match bound {
                Ok(socket) => {
                    listen = socket.local_addr().ok();
                    listener = Some(socket);
                }
                Err(e) => {
                    self.observer
                        .on_error(Some(&service), ErrorKind::BindFailed, &e.to_string());
                    return Err(RuleError::BindFailed(e));
                }
            }
        }

        let id = self.rules.insert(mode, service.clone(), address, listen);
        if let Some(socket) = listener {
            let task = tcp::spawn_listener(id, socket, self.events.clone());
            if let Some(entry) = self.rules.get_mut(id) {
                entry.listener = Some(task);
            }
        }

        log::info!(
            "forward rule added: mode={:?}, service={:?}, address={}",
            mode,
            service,
            address
        );
        Ok((id, listen))
    }

    fn del_rule(&mut self, id: u64) {
        let Some(entry) = self.rules.remove(id) else {
            return;
        };

        if let Some(task) = entry.listener {
            task.abort();
        }

        log::info!("forward rule removed: service={:?}", entry.service);

        let sessions: Vec<u16> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.rule == id)
            .map(|(id, _)| *id)
            .collect();

        for session in sessions {
            // stop admitting inbound data before the close handshake; the
            // receive buffer still flushes whatever already arrived.
            if let Some(entry) = self.sessions.get_mut(&session) {
                entry.refuse_new_data = true;
            }

            self.close_local(session, "rule removed");
        }
    }

    fn dump(&self) -> ContextDump {
        ContextDump {
            peer: *self.peer.read(),
            rules: self
                .rules
                .iter()
                .map(|entry| RuleDump {
                    id: entry.id,
                    mode: entry.mode,
                    service: entry.service.clone(),
                    address: entry.address,
                    listen: entry.listen,
                })
                .collect(),
            sessions: self
                .sessions
                .values()
                .map(|session| SessionDump {
                    id: session.id,
                    peer_id: session.peer_id,
                    service: session.service.clone(),
                    state: session.state.name(),
                    inflight: session.send.len(),
                    send_range: session.send.range(),
                    pending: session.recv.pending(),
                    delivered: session.recv.delivered(),
                    next_sequence: session.next_sequence,
                })
                .collect(),
        }
    }

    fn on_socket_error(&mut self, error: io::Error) {
        // The remote host going away surfaces as a reset (windows) or as a
        // refusal on a connected socket (linux); neither is fatal, the
        // retransmit machinery covers the gap.
        if matches!(
            error.kind(),
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
        ) {
            return;
        }

        log::error!("udp socket failed: {:?}", error);
        self.socket_dead = true;
        self.observer
            .on_error(None, ErrorKind::SocketFailed, &error.to_string());

        // sessions cannot make progress anymore; the context itself stays
        // alive so the host can still inspect and free it.
        let ids: Vec<u16> = self.sessions.keys().copied().collect();
        for id in ids {
            self.terminate(id, Finish::Aborted, "udp socket failed");
        }
    }

    fn teardown(&mut self) {
        for (_, session) in self.sessions.drain() {
            if let Some(pipe) = &session.pipe {
                pipe.abort();
            }
        }

        for entry in self.rules.drain() {
            if let Some(task) = entry.listener {
                task.abort();
            }
        }

        log::info!("context shutdown");
    }
}
