use crate::{Error, HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE, VERSION};

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Packet types carried in the fourth header byte.
///
/// `Connect`, `ConnectAck` and `ConnectFail` drive session setup, `Data` and
/// `Ack` carry the stream, `Close` tears a session down and `Ping` refreshes
/// an idle session.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum PacketType {
    Connect = 1,
    ConnectAck = 2,
    ConnectFail = 3,
    Data = 4,
    Ack = 5,
    Close = 6,
    Ping = 7,
}

/// Reason byte carried in the payload of a `ConnectFail` packet.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum FailReason {
    UnknownService = 1,
    ConnectRefused = 2,
}

/// In-memory mirror of one wire packet.
///
/// The payload borrows the datagram it was decoded from, decoding never
/// copies. `session` is the sender's session id (0 before assignment) and
/// `peer_session` is the recipient's session id (0 if not yet known).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub kind: PacketType,
    pub session: u16,
    pub peer_session: u16,
    pub sequence: u32,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Parse one datagram.
    ///
    /// Rejects with a typed error instead of panicking, the caller decides
    /// whether the datagram is foreign (bad magic/version) or merely
    /// malformed.
    ///
    /// # Test
    ///
    /// ```
    /// use tunnel_server_codec::{Packet, PacketType};
    ///
    /// let buffer = [
    ///     0x54, 0x32, 0x01, 0x04, 0x00, 0x07, 0x00, 0x09, 0x00, 0x00, 0x00,
    ///     0x2a, 0x00, 0x03, 0x61, 0x62, 0x63,
    /// ];
    ///
    /// let packet = Packet::decode(&buffer).unwrap();
    ///
    /// assert_eq!(packet.kind, PacketType::Data);
    /// assert_eq!(packet.session, 7);
    /// assert_eq!(packet.peer_session, 9);
    /// assert_eq!(packet.sequence, 42);
    /// assert_eq!(packet.payload, b"abc");
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidInput);
        }

        if u16::from_be_bytes([bytes[0], bytes[1]]) != MAGIC {
            return Err(Error::BadMagicNumber);
        }

        if bytes[2] != VERSION {
            return Err(Error::UnsupportedVersion);
        }

        let kind = PacketType::try_from(bytes[3]).map_err(|_| Error::UnknownPacketType)?;
        let size = u16::from_be_bytes([bytes[12], bytes[13]]) as usize;
        if size > MAX_PAYLOAD_SIZE || HEADER_SIZE + size > bytes.len() {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            kind,
            session: u16::from_be_bytes([bytes[4], bytes[5]]),
            peer_session: u16::from_be_bytes([bytes[6], bytes[7]]),
            sequence: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            payload: &bytes[HEADER_SIZE..HEADER_SIZE + size],
        })
    }

    /// Serialize the packet into the given buffer.
    ///
    /// The buffer is cleared first, after the call it holds exactly one wire
    /// packet.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use tunnel_server_codec::{Packet, PacketType};
    ///
    /// let packet = Packet {
    ///     kind: PacketType::Connect,
    ///     session: 1,
    ///     peer_session: 0,
    ///     sequence: 0,
    ///     payload: b"ssh",
    /// };
    ///
    /// let mut buf = BytesMut::new();
    /// packet.encode(&mut buf).unwrap();
    ///
    /// assert_eq!(
    ///     &buf[..],
    ///     &[
    ///         0x54, 0x32, 0x01, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
    ///         0x00, 0x00, 0x00, 0x03, 0x73, 0x73, 0x68,
    ///     ]
    /// );
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) -> Result<(), Error> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge);
        }

        bytes.clear();
        bytes.reserve(HEADER_SIZE + self.payload.len());
        bytes.put_u16(MAGIC);
        bytes.put_u8(VERSION);
        bytes.put_u8(self.kind.into());
        bytes.put_u16(self.session);
        bytes.put_u16(self.peer_session);
        bytes.put_u32(self.sequence);
        bytes.put_u16(self.payload.len() as u16);
        bytes.put(self.payload);
        Ok(())
    }

    /// Read the connect payload as a service name.
    pub fn service(&self) -> Result<&'a str, Error> {
        Ok(std::str::from_utf8(self.payload)?)
    }

    /// Read the first payload byte of a connect fail packet as a reason.
    pub fn fail_reason(&self) -> Option<FailReason> {
        self.payload
            .first()
            .and_then(|value| FailReason::try_from(*value).ok())
    }
}
