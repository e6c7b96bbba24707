//! Wire codec: pure encode/decode for every RakNet packet shape the client
//! needs, modeled as a sum type over the packet id (see spec.md §9, "Tagged
//! packet variants" redesign flag) rather than a class hierarchy.
//!
//! Layout mirrors `CoolLoong-raknet-rs::packet`: one module per packet
//! family (`unconnected`, `connected`), a shared `address` helper, and a
//! `Seq24` little-endian 24-bit counter used throughout the reliability
//! engine.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::CodecError;

pub mod address;
pub mod connected;
pub mod login;
pub mod unconnected;

pub use connected::{Ack, CustomPacket, EncapsulatedMessage, Record, Reliability, SplitInfo};
pub use login::{ConnectionRequest, ConnectionRequestAccepted, DisconnectNotification};
pub use unconnected::UnconnectedPacket;

/// First-byte identifiers, see spec.md §6.
pub struct PacketId;

impl PacketId {
    pub const UNCONNECTED_PING: u8 = 0x01;
    pub const UNCONNECTED_PING_OPEN_CONNECTIONS: u8 = 0x02;
    pub const UNCONNECTED_PONG: u8 = 0x1c;

    pub const OPEN_CONNECTION_REQUEST_1: u8 = 0x05;
    pub const OPEN_CONNECTION_REPLY_1: u8 = 0x06;
    pub const OPEN_CONNECTION_REQUEST_2: u8 = 0x07;
    pub const OPEN_CONNECTION_REPLY_2: u8 = 0x08;
    pub const INCOMPATIBLE_PROTOCOL_VERSION: u8 = 0x19;

    pub const CONNECTION_REQUEST: u8 = 0x09;
    pub const CONNECTION_REQUEST_ACCEPTED: u8 = 0x10;
    pub const DISCONNECT_NOTIFICATION: u8 = 0x15;

    pub const CUSTOM_RANGE_START: u8 = 0x80;
    pub const CUSTOM_RANGE_END: u8 = 0x8d;
    pub const NACK: u8 = 0xa0;
    pub const ACK: u8 = 0xc0;

    pub fn is_custom(id: u8) -> bool {
        (Self::CUSTOM_RANGE_START..=Self::CUSTOM_RANGE_END).contains(&id)
    }
}

pub const RAKNET_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

/// A decoded datagram, classified by the client façade (spec.md §4.6).
#[derive(Debug)]
pub enum Packet {
    Unconnected(UnconnectedPacket),
    Custom(CustomPacket),
    Ack(Ack),
    Nack(Ack),
}

impl Packet {
    pub fn decode(buf: &mut BytesMut) -> Result<Self, CodecError> {
        if buf.is_empty() {
            return Err(CodecError::EmptyDatagram);
        }
        let id = buf[0];
        if id == PacketId::ACK {
            buf.advance(1);
            return Ok(Packet::Ack(Ack::read(buf)?));
        }
        if id == PacketId::NACK {
            buf.advance(1);
            return Ok(Packet::Nack(Ack::read(buf)?));
        }
        if PacketId::is_custom(id) {
            buf.advance(1);
            return Ok(Packet::Custom(CustomPacket::read(buf)?));
        }
        Ok(Packet::Unconnected(UnconnectedPacket::read(buf)?))
    }

    pub fn encode(self, buf: &mut BytesMut) {
        match self {
            Packet::Unconnected(p) => p.write(buf),
            Packet::Custom(p) => {
                buf.put_u8(PacketId::CUSTOM_RANGE_START);
                p.write(buf);
            }
            Packet::Ack(a) => {
                buf.put_u8(PacketId::ACK);
                a.write(buf);
            }
            Packet::Nack(a) => {
                buf.put_u8(PacketId::NACK);
                a.write(buf);
            }
        }
    }
}

pub(crate) fn read_magic(buf: &mut BytesMut) -> Result<(), CodecError> {
    if buf.remaining() < RAKNET_MAGIC.len() {
        return Err(CodecError::Truncated { offset: buf.len() });
    }
    let got = buf.split_to(RAKNET_MAGIC.len());
    if got.as_ref() != RAKNET_MAGIC {
        return Err(CodecError::BadMagic);
    }
    Ok(())
}

pub(crate) fn write_magic(buf: &mut BytesMut) {
    buf.put_slice(&RAKNET_MAGIC);
}

pub(crate) fn read_string(buf: &mut BytesMut) -> Result<Bytes, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Truncated { offset: buf.len() });
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated { offset: buf.len() });
    }
    Ok(buf.split_to(len).freeze())
}

pub(crate) fn write_string(buf: &mut BytesMut, s: &[u8]) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s);
}

/// `uint24`, little-endian on the wire, used for datagram sequence numbers
/// and reliable/ordered/sequenced message indices. Arithmetic wraps at
/// 2^24 so a session that outlives 16M reliable sends keeps working.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Seq24(pub u32);

const SEQ24_MASK: u32 = 0x00ff_ffff;
const SEQ24_MODULUS: u32 = SEQ24_MASK + 1;
const SEQ24_HALF: u32 = SEQ24_MODULUS / 2;

impl Seq24 {
    pub const ZERO: Seq24 = Seq24(0);

    pub fn read(buf: &mut BytesMut) -> Result<Self, CodecError> {
        if buf.remaining() < 3 {
            return Err(CodecError::Truncated { offset: buf.len() });
        }
        Ok(Seq24(buf.get_uint_le(3) as u32))
    }

    pub fn write(self, buf: &mut BytesMut) {
        buf.put_uint_le(self.0 as u64, 3);
    }

    pub fn next(self) -> Seq24 {
        Seq24((self.0 + 1) & SEQ24_MASK)
    }

    /// Forward distance from `self` to `other` treating the 24-bit space as
    /// circular: `other` is ahead of `self` by this many steps (mod 2^24).
    pub fn forward_distance(self, other: Seq24) -> u32 {
        (other.0.wrapping_sub(self.0)) & SEQ24_MASK
    }

    /// True if `other` is strictly ahead of `self` on the shorter arc of the
    /// circular sequence space — handles wraparound (2^24-1 -> 0 is "ahead").
    pub fn is_ahead(self, other: Seq24) -> bool {
        let d = self.forward_distance(other);
        d != 0 && d < SEQ24_HALF
    }
}

impl From<u32> for Seq24 {
    fn from(v: u32) -> Self {
        Seq24(v & SEQ24_MASK)
    }
}

impl std::ops::Add<u32> for Seq24 {
    type Output = Seq24;
    fn add(self, rhs: u32) -> Seq24 {
        Seq24((self.0 + rhs) & SEQ24_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq24_round_trip() {
        let mut buf = BytesMut::new();
        Seq24(0x01_0203).write(&mut buf);
        assert_eq!(buf.as_ref(), &[0x03, 0x02, 0x01]);
        let mut read_buf = buf;
        assert_eq!(Seq24::read(&mut read_buf).unwrap(), Seq24(0x01_0203));
    }

    #[test]
    fn seq24_wraparound_is_forward_step() {
        let max = Seq24(SEQ24_MASK);
        let zero = Seq24(0);
        assert!(max.is_ahead(zero));
        assert_eq!(max.forward_distance(zero), 1);
        assert!(!zero.is_ahead(max));
    }
}
