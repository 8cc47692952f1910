//! ## Tunnel transport core
//!
//! Turns one udp socket into many reliable, ordered, flow-controlled byte
//! streams and bridges each of them to a local tcp socket.
//!
//! A [`Context`] owns all traffic over one udp socket pair. Within it live
//! the rule table (service name to local tcp endpoint), the session table
//! (one entry per tunneled stream, with its sliding send window and
//! reassembly buffer) and a reactor task that drives socket readiness,
//! retransmit timers and session expiry. Client rules listen for tcp
//! connections and tunnel them to the peer; server rules answer tunneled
//! connects by dialing a configured backend.
//!
//! The udp socket is created, punched and eventually closed by the host
//! application; the core only reads and writes through it.

pub mod context;
pub mod rule;
pub mod settings;

mod reactor;
mod sender;
mod session;
mod tcp;

pub use context::{Context, ContextDump, Rule, RuleDump, RuleError, SendError, SessionDump};
pub use rule::RuleMode;
pub use settings::{ContextOption, OptionError, Settings};

/// Error classes surfaced through [`Observer::on_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An option value outside its documented range.
    InvalidOption,
    /// A malformed service name in an api call.
    InvalidService,
    /// A rule with the same mode and service already exists.
    DuplicateRule,
    /// A client rule's tcp listener could not be bound.
    BindFailed,
    /// A backend tcp connect failed, or the peer reported one.
    ConnectFailed,
    /// The peer does not know the requested service.
    UnknownService,
    /// A segment ran out of retransmissions.
    RetryExhausted,
    /// The udp socket is permanently unusable.
    SocketFailed,
}

/// Hooks a context reports into.
///
/// All hooks are called from the context's reactor task: anything that
/// blocks in here stalls every session on the context, so hand heavy work
/// off to a channel or task of your own.
pub trait Observer: Send + Sync + 'static {
    /// A received datagram failed the magic or version checks and is not
    /// part of the tunnel protocol. The raw bytes are handed over so the
    /// host can run its own traffic on the shared socket.
    #[allow(unused_variables)]
    fn on_unknown_packet(&self, bytes: &[u8]) {}

    /// Something went wrong. `service` names the affected rule when there
    /// is one.
    #[allow(unused_variables)]
    fn on_error(&self, service: Option<&str>, kind: ErrorKind, message: &str) {}

    /// A session finished its handshake and is carrying data.
    #[allow(unused_variables)]
    fn on_established(&self, service: &str, session: u16) {}

    /// A session finished an orderly shutdown.
    #[allow(unused_variables)]
    fn on_closed(&self, service: &str, session: u16) {}
}
