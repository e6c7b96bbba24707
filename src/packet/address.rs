//! RakNet's address encoding: a version tag, 4 or 16 raw bytes, and a
//! big-endian port. IPv4 octets are bitwise inverted on the wire — an old
//! RakNet convention every implementation in the pack (PocketMine-RS,
//! sauoro-amethyst, CoolLoong-raknet-rs) preserves for compatibility.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{Buf, BufMut, BytesMut};

use crate::errors::CodecError;

pub fn read_address(buf: &mut BytesMut) -> Result<SocketAddr, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated { offset: buf.len() });
    }
    let version = buf.get_u8();
    match version {
        4 => {
            if buf.remaining() < 6 {
                return Err(CodecError::Truncated { offset: buf.len() });
            }
            let octets = [
                !buf.get_u8(),
                !buf.get_u8(),
                !buf.get_u8(),
                !buf.get_u8(),
            ];
            let port = buf.get_u16();
            Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
        }
        6 => {
            if buf.remaining() < 16 + 2 {
                return Err(CodecError::Truncated { offset: buf.len() });
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                0,
                0,
            )))
        }
        v => Err(CodecError::InvalidAddressVersion(v)),
    }
}

pub fn write_address(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(4);
            for octet in v4.ip().octets() {
                buf.put_u8(!octet);
            }
            buf.put_u16(v4.port());
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(6);
            buf.put_slice(&v6.ip().octets());
            buf.put_u16(v6.port());
        }
    }
}
