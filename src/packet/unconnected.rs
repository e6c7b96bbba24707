//! Unconnected (offline) status packets: discovery pings/pongs and the
//! handshake's first two phases. Every variant round-trips through
//! [`UnconnectedPacket::read`]/[`write`] and each one that the wire format
//! says carries the magic cookie enforces it on decode, per spec.md §4.1.

use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{address, read_magic, read_string, write_magic, write_string, PacketId};
use crate::errors::CodecError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnconnectedPacket {
    Ping {
        client_timestamp: i64,
        client_guid: u64,
    },
    PingOpenConnections {
        client_timestamp: i64,
        client_guid: u64,
    },
    Pong {
        server_timestamp: i64,
        server_guid: u64,
        identifier: Bytes,
    },
    OpenConnectionRequest1 {
        protocol_version: u8,
        /// Total size of the datagram as sent, used by the server to infer
        /// the candidate MTU from the padding length (spec.md §4.4).
        datagram_size: usize,
    },
    OpenConnectionReply1 {
        server_guid: u64,
        use_security: bool,
        mtu_size: u16,
    },
    OpenConnectionRequest2 {
        server_address: SocketAddr,
        mtu_size: u16,
        client_guid: u64,
    },
    OpenConnectionReply2 {
        server_guid: u64,
        client_address: SocketAddr,
        mtu_size: u16,
        use_encryption: bool,
    },
    IncompatibleProtocolVersion {
        server_protocol_version: u8,
        server_guid: u64,
    },
}

impl UnconnectedPacket {
    pub fn read(buf: &mut BytesMut) -> Result<Self, CodecError> {
        if buf.remaining() < 1 {
            return Err(CodecError::Truncated { offset: buf.len() });
        }
        let id = buf.get_u8();
        match id {
            PacketId::UNCONNECTED_PING | PacketId::UNCONNECTED_PING_OPEN_CONNECTIONS => {
                if buf.remaining() < 8 {
                    return Err(CodecError::Truncated { offset: buf.len() });
                }
                let client_timestamp = buf.get_i64();
                read_magic(buf)?;
                if buf.remaining() < 8 {
                    return Err(CodecError::Truncated { offset: buf.len() });
                }
                let client_guid = buf.get_u64();
                if id == PacketId::UNCONNECTED_PING {
                    Ok(UnconnectedPacket::Ping {
                        client_timestamp,
                        client_guid,
                    })
                } else {
                    Ok(UnconnectedPacket::PingOpenConnections {
                        client_timestamp,
                        client_guid,
                    })
                }
            }
            PacketId::UNCONNECTED_PONG => {
                if buf.remaining() < 16 {
                    return Err(CodecError::Truncated { offset: buf.len() });
                }
                let server_timestamp = buf.get_i64();
                let server_guid = buf.get_u64();
                read_magic(buf)?;
                let identifier = read_string(buf)?;
                Ok(UnconnectedPacket::Pong {
                    server_timestamp,
                    server_guid,
                    identifier,
                })
            }
            PacketId::OPEN_CONNECTION_REQUEST_1 => {
                let datagram_size = buf.len() + 1; // +1 for the id byte already consumed
                read_magic(buf)?;
                if buf.remaining() < 1 {
                    return Err(CodecError::Truncated { offset: buf.len() });
                }
                let protocol_version = buf.get_u8();
                // Remaining bytes are MTU padding; discard.
                buf.advance(buf.remaining());
                Ok(UnconnectedPacket::OpenConnectionRequest1 {
                    protocol_version,
                    datagram_size,
                })
            }
            PacketId::OPEN_CONNECTION_REPLY_1 => {
                read_magic(buf)?;
                if buf.remaining() < 11 {
                    return Err(CodecError::Truncated { offset: buf.len() });
                }
                let server_guid = buf.get_u64();
                let use_security = buf.get_u8() != 0;
                let mtu_size = buf.get_u16();
                Ok(UnconnectedPacket::OpenConnectionReply1 {
                    server_guid,
                    use_security,
                    mtu_size,
                })
            }
            PacketId::OPEN_CONNECTION_REQUEST_2 => {
                read_magic(buf)?;
                let server_address = address::read_address(buf)?;
                if buf.remaining() < 10 {
                    return Err(CodecError::Truncated { offset: buf.len() });
                }
                let mtu_size = buf.get_u16();
                let client_guid = buf.get_u64();
                Ok(UnconnectedPacket::OpenConnectionRequest2 {
                    server_address,
                    mtu_size,
                    client_guid,
                })
            }
            PacketId::OPEN_CONNECTION_REPLY_2 => {
                read_magic(buf)?;
                if buf.remaining() < 8 {
                    return Err(CodecError::Truncated { offset: buf.len() });
                }
                let server_guid = buf.get_u64();
                let client_address = address::read_address(buf)?;
                if buf.remaining() < 3 {
                    return Err(CodecError::Truncated { offset: buf.len() });
                }
                let mtu_size = buf.get_u16();
                let use_encryption = buf.get_u8() != 0;
                Ok(UnconnectedPacket::OpenConnectionReply2 {
                    server_guid,
                    client_address,
                    mtu_size,
                    use_encryption,
                })
            }
            PacketId::INCOMPATIBLE_PROTOCOL_VERSION => {
                if buf.remaining() < 1 {
                    return Err(CodecError::Truncated { offset: buf.len() });
                }
                let server_protocol_version = buf.get_u8();
                read_magic(buf)?;
                if buf.remaining() < 8 {
                    return Err(CodecError::Truncated { offset: buf.len() });
                }
                let server_guid = buf.get_u64();
                Ok(UnconnectedPacket::IncompatibleProtocolVersion {
                    server_protocol_version,
                    server_guid,
                })
            }
            other => Err(CodecError::UnknownPacketId(other)),
        }
    }

    pub fn write(self, buf: &mut BytesMut) {
        match self {
            UnconnectedPacket::Ping {
                client_timestamp,
                client_guid,
            } => {
                buf.put_u8(PacketId::UNCONNECTED_PING);
                buf.put_i64(client_timestamp);
                write_magic(buf);
                buf.put_u64(client_guid);
            }
            UnconnectedPacket::PingOpenConnections {
                client_timestamp,
                client_guid,
            } => {
                buf.put_u8(PacketId::UNCONNECTED_PING_OPEN_CONNECTIONS);
                buf.put_i64(client_timestamp);
                write_magic(buf);
                buf.put_u64(client_guid);
            }
            UnconnectedPacket::Pong {
                server_timestamp,
                server_guid,
                identifier,
            } => {
                buf.put_u8(PacketId::UNCONNECTED_PONG);
                buf.put_i64(server_timestamp);
                buf.put_u64(server_guid);
                write_magic(buf);
                write_string(buf, &identifier);
            }
            UnconnectedPacket::OpenConnectionRequest1 {
                protocol_version,
                datagram_size,
            } => {
                buf.put_u8(PacketId::OPEN_CONNECTION_REQUEST_1);
                write_magic(buf);
                buf.put_u8(protocol_version);
                let written = 1 + RAKNET_MAGIC_LEN + 1;
                let padding = datagram_size.saturating_sub(written);
                buf.put_bytes(0, padding);
            }
            UnconnectedPacket::OpenConnectionReply1 {
                server_guid,
                use_security,
                mtu_size,
            } => {
                buf.put_u8(PacketId::OPEN_CONNECTION_REPLY_1);
                write_magic(buf);
                buf.put_u64(server_guid);
                buf.put_u8(use_security as u8);
                buf.put_u16(mtu_size);
            }
            UnconnectedPacket::OpenConnectionRequest2 {
                server_address,
                mtu_size,
                client_guid,
            } => {
                buf.put_u8(PacketId::OPEN_CONNECTION_REQUEST_2);
                write_magic(buf);
                address::write_address(buf, &server_address);
                buf.put_u16(mtu_size);
                buf.put_u64(client_guid);
            }
            UnconnectedPacket::OpenConnectionReply2 {
                server_guid,
                client_address,
                mtu_size,
                use_encryption,
            } => {
                buf.put_u8(PacketId::OPEN_CONNECTION_REPLY_2);
                write_magic(buf);
                buf.put_u64(server_guid);
                address::write_address(buf, &client_address);
                buf.put_u16(mtu_size);
                buf.put_u8(use_encryption as u8);
            }
            UnconnectedPacket::IncompatibleProtocolVersion {
                server_protocol_version,
                server_guid,
            } => {
                buf.put_u8(PacketId::INCOMPATIBLE_PROTOCOL_VERSION);
                buf.put_u8(server_protocol_version);
                write_magic(buf);
                buf.put_u64(server_guid);
            }
        }
    }
}

const RAKNET_MAGIC_LEN: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(p: UnconnectedPacket) -> UnconnectedPacket {
        let mut buf = BytesMut::new();
        p.clone().write(&mut buf);
        UnconnectedPacket::read(&mut buf).unwrap()
    }

    #[test]
    fn ping_round_trips() {
        let p = UnconnectedPacket::Ping {
            client_timestamp: 1234,
            client_guid: 0xA,
        };
        assert_eq!(round_trip(p.clone()), p);
    }

    #[test]
    fn pong_round_trips_with_identifier() {
        let p = UnconnectedPacket::Pong {
            server_timestamp: 77,
            server_guid: 0xBEEF,
            identifier: Bytes::from_static(b"MCPE;Server;"),
        };
        assert_eq!(round_trip(p.clone()), p);
    }

    #[test]
    fn reply1_round_trips() {
        let p = UnconnectedPacket::OpenConnectionReply1 {
            server_guid: 99,
            use_security: false,
            mtu_size: 1400,
        };
        assert_eq!(round_trip(p.clone()), p);
    }

    #[test]
    fn request2_round_trips_with_address() {
        let p = UnconnectedPacket::OpenConnectionRequest2 {
            server_address: "127.0.0.1:19132".parse().unwrap(),
            mtu_size: 1400,
            client_guid: 42,
        };
        assert_eq!(round_trip(p.clone()), p);
    }

    #[test]
    fn request1_pads_to_requested_datagram_size() {
        let p = UnconnectedPacket::OpenConnectionRequest1 {
            protocol_version: 11,
            datagram_size: 1492,
        };
        let mut buf = BytesMut::new();
        p.write(&mut buf);
        assert_eq!(buf.len(), 1492);
    }

    #[test]
    fn bad_magic_is_malformed_packet() {
        let mut buf = BytesMut::new();
        buf.put_u8(PacketId::UNCONNECTED_PING);
        buf.put_i64(0);
        buf.put_slice(&[0u8; 16]); // wrong magic
        buf.put_u64(0);
        assert_eq!(UnconnectedPacket::read(&mut buf), Err(CodecError::BadMagic));
    }
}
