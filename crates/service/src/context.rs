use std::{io, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
};

use crate::{
    Observer,
    reactor::{self, Reactor},
    rule::RuleMode,
    sender,
    settings::{ContextOption, OptionError, Settings},
};

pub(crate) enum Command {
    AddRule {
        mode: RuleMode,
        service: String,
        address: SocketAddr,
        done: oneshot::Sender<Result<(u64, Option<SocketAddr>), RuleError>>,
    },
    DelRule {
        id: u64,
    },
    Dump {
        done: oneshot::Sender<ContextDump>,
    },
    Shutdown,
}

/// Why a rule could not be added.
#[derive(Debug)]
pub enum RuleError {
    /// Service names are 1 to 255 bytes of utf-8.
    InvalidService,
    /// A rule with the same mode and service already exists.
    DuplicateRule,
    /// The tcp listener could not be bound.
    BindFailed(io::Error),
    /// The context is gone.
    Closed,
}

impl std::error::Error for RuleError {}

impl std::fmt::Display for RuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidService => write!(f, "service name must be 1..=255 bytes"),
            Self::DuplicateRule => write!(f, "duplicate rule for mode and service"),
            Self::BindFailed(e) => write!(f, "tcp listener bind failed: {}", e),
            Self::Closed => write!(f, "context is closed"),
        }
    }
}

/// Why a raw payload could not be injected.
#[derive(Debug)]
pub enum SendError {
    /// No peer address is known yet; nothing has been heard on the socket
    /// and it is not connected.
    NoPeer,
    /// The context is gone.
    Closed,
}

impl std::error::Error for SendError {}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPeer => write!(f, "peer address unknown"),
            Self::Closed => write!(f, "context is closed"),
        }
    }
}

/// Handle to one installed forward rule.
///
/// Dropping the handle leaves the rule installed; removal is explicit.
pub struct Rule {
    id: u64,
    mode: RuleMode,
    service: String,
    listen: Option<SocketAddr>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Rule {
    pub fn mode(&self) -> RuleMode {
        self.mode
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// The actually bound listen address of a client rule. Useful when the
    /// rule was added with port 0.
    pub fn listen(&self) -> Option<SocketAddr> {
        self.listen
    }

    /// Gracefully remove the rule: the listener closes, active sessions
    /// drain their buffers, say goodbye to their peers and linger out.
    pub fn remove(self) {
        let _ = self.commands.send(Command::DelRule { id: self.id });
    }
}

/// Point-in-time snapshot of a context's tables, for diagnostics.
#[derive(Debug, Clone)]
pub struct ContextDump {
    pub peer: Option<SocketAddr>,
    pub rules: Vec<RuleDump>,
    pub sessions: Vec<SessionDump>,
}

#[derive(Debug, Clone)]
pub struct RuleDump {
    pub id: u64,
    pub mode: RuleMode,
    pub service: String,
    pub address: SocketAddr,
    pub listen: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct SessionDump {
    pub id: u16,
    pub peer_id: u16,
    pub service: String,
    pub state: &'static str,
    pub inflight: usize,
    pub send_range: Option<(u32, u32)>,
    pub pending: usize,
    pub delivered: u32,
    pub next_sequence: u32,
}

/// One udp socket and everything tunneled over it.
///
/// The socket is shared with the caller, who created it and will close it;
/// the context only reads and writes through it, and claims the sole writer
/// identity for as long as it lives. All protocol state lives on a reactor
/// task spawned here; this handle is a thin command front end.
///
/// Dropping the handle shuts the context down the same way [`Context::shutdown`]
/// does: sessions are cancelled immediately, no close is emitted.
pub struct Context<T> {
    commands: mpsc::UnboundedSender<Command>,
    outgoing: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    settings: Arc<RwLock<Settings>>,
    peer: Arc<RwLock<Option<SocketAddr>>>,
    observer: Arc<T>,
}

impl<T: Observer> Context<T> {
    /// Install a udp socket and start the reactor.
    ///
    /// If the socket is connected its peer address is used right away;
    /// otherwise the peer is learned from the first valid packet heard on
    /// the socket.
    pub fn new(socket: Arc<UdpSocket>, observer: T) -> Self {
        let observer = Arc::new(observer);
        let settings = Arc::new(RwLock::new(Settings::default()));
        let peer = Arc::new(RwLock::new(socket.peer_addr().ok()));

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(sender::run(socket.clone(), outgoing_rx, settings.clone()));
        tokio::spawn(reactor::run(
            Reactor::new(
                socket,
                observer.clone(),
                settings.clone(),
                peer.clone(),
                outgoing.clone(),
                events,
            ),
            commands_rx,
            events_rx,
        ));

        Self {
            commands,
            outgoing,
            settings,
            peer,
            observer,
        }
    }

    /// Apply one option value. Values outside the documented range are
    /// rejected and reported through the error hook.
    pub fn set_option(&self, option: ContextOption, value: u64) -> Result<(), OptionError> {
        let result = self.settings.write().set(option, value);
        if let Err(e) = &result {
            self.observer
                .on_error(None, crate::ErrorKind::InvalidOption, &e.to_string());
        }

        result
    }

    /// Install a forward rule.
    ///
    /// For client rules `address` is the local tcp listen address; for
    /// server rules it is the backend to connect tunneled streams to.
    /// Validation failures come back synchronously and also fire the error
    /// hook.
    pub async fn add_rule(
        &self,
        mode: RuleMode,
        service: &str,
        address: SocketAddr,
    ) -> Result<Rule, RuleError> {
        let (done, wait) = oneshot::channel();
        self.commands
            .send(Command::AddRule {
                mode,
                service: service.to_string(),
                address,
                done,
            })
            .map_err(|_| RuleError::Closed)?;

        let (id, listen) = wait.await.map_err(|_| RuleError::Closed)??;
        Ok(Rule {
            id,
            mode,
            service: service.to_string(),
            listen,
            commands: self.commands.clone(),
        })
    }

    /// Gracefully remove a rule. Equivalent to [`Rule::remove`].
    pub fn del_rule(&self, rule: Rule) {
        rule.remove();
    }

    /// Inject a raw payload on the context's udp socket.
    ///
    /// The socket belongs to the context for as long as it lives, so this
    /// is the only way for the host to put its own datagrams (hole punch
    /// refreshes and the like) on the wire, serialized with the protocol
    /// traffic.
    pub fn send_raw(&self, bytes: Bytes) -> Result<(), SendError> {
        let peer = (*self.peer.read()).ok_or(SendError::NoPeer)?;
        self.outgoing
            .send((bytes, peer))
            .map_err(|_| SendError::Closed)
    }

    /// Snapshot the context's rules and sessions.
    pub async fn dump(&self) -> Option<ContextDump> {
        let (done, wait) = oneshot::channel();
        self.commands.send(Command::Dump { done }).ok()?;
        wait.await.ok()
    }

    /// Destroy every rule and session immediately. No close packets are
    /// emitted and pending commands are dropped. The udp socket itself is
    /// untouched; closing it remains the caller's job.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}
