//! The offline handshake: MTU negotiation followed by login, run as a
//! cooperative `async fn` driven by `tokio::time` rather than the polling
//! busy-wait loop upstream clients use for this phase (spec.md §9, "busy
//! wait handshake loop" redesign flag). A `watch` channel lets
//! [`crate::client::Client::disconnect`] cancel an in-flight attempt
//! instead of leaving it to time out on its own.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::sync::watch;

use crate::endpoint::Endpoint;
use crate::errors::ClientError;
use crate::packet::{
    login::{ConnectionRequest, ConnectionRequestAccepted},
    Packet, Reliability, UnconnectedPacket,
};
use crate::reliability::{Engine, DEFAULT_RESEND_TIMEOUT};

/// `(mtu, retries)` candidates tried in order, widest first, matching the
/// ladder `sauoro-amethyst`'s offline handshake negotiates down through
/// when the first candidate draws no reply (spec.md §5).
pub const MTU_LADDER: [(u16, u32); 3] = [(1492, 4), (1200, 5), (576, 5)];

const RETRY_TIMEOUT: Duration = Duration::from_millis(500);
const LOGIN_RETRY_TIMEOUT: Duration = Duration::from_millis(750);
const LOGIN_RETRIES: u32 = 5;

pub struct HandshakeOutcome {
    pub server_guid: u64,
    pub client_address: SocketAddr,
    pub mtu: u16,
    /// The reliability engine used to send the login request, handed to
    /// the session so message/order indices stay continuous across the
    /// handshake-to-connected transition.
    pub engine: Engine,
}

pub async fn run<E: Endpoint>(
    endpoint: &mut E,
    server_addr: SocketAddr,
    client_guid: u64,
    protocol_version: u8,
    cancel: &mut watch::Receiver<bool>,
) -> Result<HandshakeOutcome, ClientError> {
    let (mtu, server_guid) = negotiate_mtu(endpoint, server_addr, protocol_version, cancel).await?;
    let client_address = request_open_connection(endpoint, server_addr, mtu, client_guid, cancel).await?;
    let (engine, _accepted) = login(endpoint, server_addr, mtu, client_guid, cancel).await?;

    Ok(HandshakeOutcome {
        server_guid,
        client_address,
        mtu,
        engine,
    })
}

async fn negotiate_mtu<E: Endpoint>(
    endpoint: &mut E,
    server_addr: SocketAddr,
    protocol_version: u8,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(u16, u64), ClientError> {
    for (mtu, retries) in MTU_LADDER {
        for _ in 0..retries {
            let request = Packet::Unconnected(UnconnectedPacket::OpenConnectionRequest1 {
                protocol_version,
                datagram_size: mtu as usize,
            });
            send(endpoint, server_addr, request).await?;

            match wait_for(endpoint, RETRY_TIMEOUT, cancel, |packet, from| {
                if from != server_addr {
                    return None;
                }
                match packet {
                    Packet::Unconnected(UnconnectedPacket::OpenConnectionReply1 {
                        server_guid,
                        mtu_size,
                        ..
                    }) => Some(Ok((mtu_size.min(mtu), server_guid))),
                    Packet::Unconnected(UnconnectedPacket::IncompatibleProtocolVersion { .. }) => {
                        Some(Err(ClientError::ProtocolMismatch))
                    }
                    _ => None,
                }
            })
            .await?
            {
                Some(result) => return result,
                None => continue, // timed out this attempt, retry
            }
        }
    }
    Err(ClientError::ServerOffline)
}

async fn request_open_connection<E: Endpoint>(
    endpoint: &mut E,
    server_addr: SocketAddr,
    mtu: u16,
    client_guid: u64,
    cancel: &mut watch::Receiver<bool>,
) -> Result<SocketAddr, ClientError> {
    for _ in 0..MTU_LADDER.iter().map(|(_, r)| *r).max().unwrap_or(5) {
        let request = Packet::Unconnected(UnconnectedPacket::OpenConnectionRequest2 {
            server_address: server_addr,
            mtu_size: mtu,
            client_guid,
        });
        send(endpoint, server_addr, request).await?;

        if let Some(result) = wait_for(endpoint, RETRY_TIMEOUT, cancel, |packet, from| {
            if from != server_addr {
                return None;
            }
            match packet {
                Packet::Unconnected(UnconnectedPacket::OpenConnectionReply2 { client_address, .. }) => {
                    Some(Ok(client_address))
                }
                Packet::Unconnected(UnconnectedPacket::IncompatibleProtocolVersion { .. }) => {
                    Some(Err(ClientError::ProtocolMismatch))
                }
                _ => None,
            }
        })
        .await?
        {
            return result;
        }
    }
    Err(ClientError::ServerOffline)
}

async fn login<E: Endpoint>(
    endpoint: &mut E,
    server_addr: SocketAddr,
    mtu: u16,
    client_guid: u64,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(Engine, ConnectionRequestAccepted), ClientError> {
    let mut engine = Engine::new(mtu as usize);

    for _ in 0..LOGIN_RETRIES {
        let request = ConnectionRequest {
            client_guid,
            request_timestamp: 0,
            use_security: false,
        };
        let mut body = BytesMut::new();
        request.write(&mut body);
        engine.send(Reliability::ReliableOrdered, 0, body.freeze());

        let now = Instant::now();
        let batch = engine.update(now, DEFAULT_RESEND_TIMEOUT);
        for datagram in batch.datagrams {
            send(endpoint, server_addr, Packet::Custom(datagram)).await?;
        }

        if let Some(result) = wait_for(endpoint, LOGIN_RETRY_TIMEOUT, cancel, |packet, from| {
            if from != server_addr {
                return None;
            }
            match packet {
                Packet::Custom(datagram) => Some(Ok(datagram)),
                _ => None,
            }
        })
        .await?
        {
            let datagram = result?;
            for payload in engine.on_datagram(datagram) {
                if let Some(accepted) = try_parse_accepted(&payload) {
                    return Ok((engine, accepted));
                }
            }
        }
    }
    Err(ClientError::ServerOffline)
}

fn try_parse_accepted(payload: &Bytes) -> Option<ConnectionRequestAccepted> {
    let mut buf = BytesMut::from(payload.as_ref());
    ConnectionRequestAccepted::read(&mut buf).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::login::ConnectionRequestAccepted;
    use futures::channel::mpsc;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// An in-memory endpoint whose `respond` closure decides what (if
    /// anything) comes back for each outbound datagram, so the handshake
    /// ladder can be driven without a real socket or a real timeout.
    struct FakeEndpoint<F> {
        server_addr: SocketAddr,
        respond: F,
        inbound: mpsc::UnboundedReceiver<(Packet, SocketAddr)>,
        inbound_tx: mpsc::UnboundedSender<(Packet, SocketAddr)>,
    }

    impl<F> FakeEndpoint<F>
    where
        F: FnMut(&Packet) -> Option<Packet>,
    {
        fn new(server_addr: SocketAddr, respond: F) -> Self {
            let (tx, rx) = mpsc::unbounded();
            FakeEndpoint {
                server_addr,
                respond,
                inbound: rx,
                inbound_tx: tx,
            }
        }
    }

    impl<F> futures::Stream for FakeEndpoint<F>
    where
        F: FnMut(&Packet) -> Option<Packet> + Unpin,
    {
        type Item = Result<(Packet, SocketAddr), crate::errors::CodecError>;
        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.inbound).poll_next(cx).map(|opt| opt.map(Ok))
        }
    }

    impl<F> futures::Sink<(Packet, SocketAddr)> for FakeEndpoint<F>
    where
        F: FnMut(&Packet) -> Option<Packet> + Unpin,
    {
        type Error = crate::errors::CodecError;
        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn start_send(mut self: Pin<&mut Self>, item: (Packet, SocketAddr)) -> Result<(), Self::Error> {
            let (packet, _addr) = item;
            if let Some(reply) = (self.respond)(&packet) {
                let _ = self.inbound_tx.unbounded_send((reply, self.server_addr));
            }
            Ok(())
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mtu_ladder_falls_back_when_the_widest_candidate_draws_no_reply() {
        let server_addr: SocketAddr = "127.0.0.1:19132".parse().unwrap();
        let mut endpoint = FakeEndpoint::new(server_addr, |packet| match packet {
            Packet::Unconnected(UnconnectedPacket::OpenConnectionRequest1 { datagram_size, .. }) => {
                if *datagram_size as u16 == MTU_LADDER[0].0 {
                    None // widest candidate: simulate a server that never answers
                } else {
                    Some(Packet::Unconnected(UnconnectedPacket::OpenConnectionReply1 {
                        server_guid: 0xF00D,
                        use_security: false,
                        mtu_size: *datagram_size as u16,
                    }))
                }
            }
            _ => None,
        });
        let (_tx, mut cancel_rx) = watch::channel(false);

        let (mtu, server_guid) = negotiate_mtu(&mut endpoint, server_addr, 11, &mut cancel_rx)
            .await
            .unwrap();

        assert_eq!(mtu, MTU_LADDER[1].0);
        assert_eq!(server_guid, 0xF00D);
    }

    #[tokio::test(start_paused = true)]
    async fn incompatible_protocol_version_is_reported_immediately() {
        let server_addr: SocketAddr = "127.0.0.1:19132".parse().unwrap();
        let mut endpoint = FakeEndpoint::new(server_addr, |packet| match packet {
            Packet::Unconnected(UnconnectedPacket::OpenConnectionRequest1 { .. }) => {
                Some(Packet::Unconnected(UnconnectedPacket::IncompatibleProtocolVersion {
                    server_protocol_version: 99,
                    server_guid: 1,
                }))
            }
            _ => None,
        });
        let (_tx, mut cancel_rx) = watch::channel(false);

        let err = negotiate_mtu(&mut endpoint, server_addr, 11, &mut cancel_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ProtocolMismatch));
    }

    #[tokio::test(start_paused = true)]
    async fn login_completes_once_the_server_accepts_the_connection_request() {
        let server_addr: SocketAddr = "127.0.0.1:19132".parse().unwrap();
        let mut endpoint = FakeEndpoint::new(server_addr, move |packet| {
            if let Packet::Custom(datagram) = packet {
                let mut server_engine = Engine::new(1200);
                for msg in &datagram.messages {
                    if msg.payload.first() == Some(&crate::packet::PacketId::CONNECTION_REQUEST) {
                        let accepted = ConnectionRequestAccepted {
                            client_address: "127.0.0.1:4000".parse().unwrap(),
                            system_index: 0,
                            request_timestamp: 0,
                            accepted_timestamp: 0,
                        };
                        let mut body = BytesMut::new();
                        accepted.write(&mut body);
                        server_engine.send(Reliability::ReliableOrdered, 0, body.freeze());
                    }
                }
                let batch = server_engine.update(Instant::now(), DEFAULT_RESEND_TIMEOUT);
                return batch.datagrams.into_iter().next().map(Packet::Custom);
            }
            None
        });
        let (_tx, mut cancel_rx) = watch::channel(false);

        let (_engine, accepted) = login(&mut endpoint, server_addr, 1200, 42, &mut cancel_rx)
            .await
            .unwrap();
        assert_eq!(accepted.client_address, "127.0.0.1:4000".parse().unwrap());
    }
}

async fn send<E: Endpoint>(endpoint: &mut E, addr: SocketAddr, packet: Packet) -> Result<(), ClientError> {
    endpoint
        .send((packet, addr))
        .await
        .map_err(|_| ClientError::TransportError {
            addr: Some(addr),
            source: std::io::Error::new(std::io::ErrorKind::Other, "endpoint send failed"),
        })
}

/// Waits up to `timeout` for the endpoint to yield a datagram `matcher`
/// accepts, or for `cancel` to flip. Returns:
/// - `Ok(Some(value))` if `matcher` matched and produced `value`,
/// - `Ok(None)` on timeout (caller should retry),
/// - `Err` if cancelled or the endpoint closed.
async fn wait_for<E, F, T>(
    endpoint: &mut E,
    timeout: Duration,
    cancel: &mut watch::Receiver<bool>,
    mut matcher: F,
) -> Result<Option<T>, ClientError>
where
    E: Endpoint,
    F: FnMut(Packet, SocketAddr) -> Option<T>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return Err(ClientError::ConnectionCancelled);
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Ok(None);
            }
            next = endpoint.next() => {
                match next {
                    Some(Ok((packet, from))) => {
                        if let Some(value) = matcher(packet, from) {
                            return Ok(Some(value));
                        }
                    }
                    Some(Err(_)) => continue,
                    None => {
                        return Err(ClientError::TransportError {
                            addr: None,
                            source: std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "endpoint stream closed",
                            ),
                        });
                    }
                }
            }
        }
    }
}
