//! `tokio_util::codec` glue so a [`tokio_util::udp::UdpFramed`] can speak
//! [`Packet`] directly, the same framing role `CoolLoong-raknet-rs` gives
//! its own codec types in `link.rs`.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::CodecError;
use crate::packet::Packet;

#[derive(Debug, Default, Clone, Copy)]
pub struct RakNetCodec;

impl Decoder for RakNetCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        // Each UDP datagram is exactly one packet; UdpFramed hands us the
        // whole datagram per call, so there is never a partial frame to
        // wait on the way a stream-oriented codec would.
        let frame = std::mem::take(src);
        let mut frame = frame;
        let packet = Packet::decode(&mut frame)?;
        Ok(Some(packet))
    }
}

impl Encoder<Packet> for RakNetCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::UnconnectedPacket;

    #[test]
    fn round_trips_through_encoder_and_decoder() {
        let mut codec = RakNetCodec;
        let mut buf = BytesMut::new();
        let packet = Packet::Unconnected(UnconnectedPacket::Ping {
            client_timestamp: 1,
            client_guid: 2,
        });
        codec.encode(packet, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Packet::Unconnected(UnconnectedPacket::Ping { client_timestamp, client_guid }) => {
                assert_eq!(client_timestamp, 1);
                assert_eq!(client_guid, 2);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn empty_buffer_decodes_to_none() {
        let mut codec = RakNetCodec;
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
