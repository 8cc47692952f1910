//! ## Tunnel wire protocol
//!
//! Every datagram exchanged between two forwarders shares a fixed 14 byte
//! header followed by an optional payload. All multi-byte integers are in
//! network byte order, there is no padding and no alignment requirement.
//!
//! ```text
//! 0               2       3       4               6               8
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |     magic     |  ver  | type  |    session    |  peer session |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |           sequence            |  payload len  |    payload...
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! The header plus payload never exceeds 1400 bytes so that a packet fits
//! into a single non-fragmented udp datagram on common paths.

pub mod packet;

pub use packet::{FailReason, Packet, PacketType};

use std::str::Utf8Error;

/// Protocol magic number, the first two bytes of every packet.
pub const MAGIC: u16 = 0x5432;

/// Current protocol version.
pub const VERSION: u8 = 1;

/// Size of the fixed packet header.
pub const HEADER_SIZE: usize = 14;

/// Largest packet that will be emitted on the wire.
pub const MAX_PACKET_SIZE: usize = 1400;

/// Largest payload a single packet can carry.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Largest service name a connect packet can carry.
pub const MAX_SERVICE_SIZE: usize = 255;

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    BadMagicNumber,
    UnsupportedVersion,
    UnknownPacketType,
    PayloadTooLarge,
    Utf8Error(Utf8Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl Error {
    /// Whether the datagram failed the magic or version checks, meaning it
    /// does not belong to this protocol at all. Such datagrams are handed to
    /// the unknown packet hook instead of being silently dropped.
    pub fn is_foreign(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput | Self::BadMagicNumber | Self::UnsupportedVersion
        )
    }
}
