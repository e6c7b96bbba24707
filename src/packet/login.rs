//! Payloads carried inside [`super::connected::EncapsulatedMessage`] bodies
//! during and after the handshake. Unlike the top-level [`super::Packet`]
//! variants these are never datagram-framed directly; the session decodes
//! them from a reassembled message payload once its id byte is matched.

use bytes::{Buf, BufMut, BytesMut};

use super::{address, PacketId};
use crate::errors::CodecError;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub client_guid: u64,
    pub request_timestamp: i64,
    pub use_security: bool,
}

impl ConnectionRequest {
    pub fn read(buf: &mut BytesMut) -> Result<Self, CodecError> {
        if buf.remaining() < 1 {
            return Err(CodecError::Truncated { offset: buf.len() });
        }
        if buf.get_u8() != PacketId::CONNECTION_REQUEST {
            return Err(CodecError::UnknownPacketId(buf[0]));
        }
        if buf.remaining() < 17 {
            return Err(CodecError::Truncated { offset: buf.len() });
        }
        let client_guid = buf.get_u64();
        let request_timestamp = buf.get_i64();
        let use_security = buf.get_u8() != 0;
        Ok(ConnectionRequest {
            client_guid,
            request_timestamp,
            use_security,
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(PacketId::CONNECTION_REQUEST);
        buf.put_u64(self.client_guid);
        buf.put_i64(self.request_timestamp);
        buf.put_u8(self.use_security as u8);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequestAccepted {
    pub client_address: SocketAddr,
    pub system_index: u16,
    pub request_timestamp: i64,
    pub accepted_timestamp: i64,
}

impl ConnectionRequestAccepted {
    pub fn read(buf: &mut BytesMut) -> Result<Self, CodecError> {
        if buf.remaining() < 1 {
            return Err(CodecError::Truncated { offset: buf.len() });
        }
        if buf.get_u8() != PacketId::CONNECTION_REQUEST_ACCEPTED {
            return Err(CodecError::UnknownPacketId(buf[0]));
        }
        let client_address = address::read_address(buf)?;
        if buf.remaining() < 2 {
            return Err(CodecError::Truncated { offset: buf.len() });
        }
        let system_index = buf.get_u16();
        // Upstream RakNet repeats a block of internal system addresses here;
        // this client discards them, matching sauoro-amethyst's reader.
        while buf.remaining() > 16 {
            let _ = address::read_address(buf)?;
        }
        if buf.remaining() < 16 {
            return Err(CodecError::Truncated { offset: buf.len() });
        }
        let request_timestamp = buf.get_i64();
        let accepted_timestamp = buf.get_i64();
        Ok(ConnectionRequestAccepted {
            client_address,
            system_index,
            request_timestamp,
            accepted_timestamp,
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(PacketId::CONNECTION_REQUEST_ACCEPTED);
        address::write_address(buf, &self.client_address);
        buf.put_u16(self.system_index);
        buf.put_i64(self.request_timestamp);
        buf.put_i64(self.accepted_timestamp);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectNotification;

impl DisconnectNotification {
    pub fn read(buf: &mut BytesMut) -> Result<Self, CodecError> {
        if buf.remaining() < 1 {
            return Err(CodecError::Truncated { offset: buf.len() });
        }
        if buf.get_u8() != PacketId::DISCONNECT_NOTIFICATION {
            return Err(CodecError::UnknownPacketId(buf[0]));
        }
        Ok(DisconnectNotification)
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(PacketId::DISCONNECT_NOTIFICATION);
    }
}
