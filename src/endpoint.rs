//! The client's view of the network: a `Sink`/`Stream` pair over
//! `(Packet, SocketAddr)`. Modeled as a trait alias over `futures`' `Sink`
//! and `Stream`, not `async_trait`, so the concrete `UdpSocket` transport
//! stays on the same combinator-based footing `CoolLoong-raknet-rs` builds
//! its `TransferLink`/`Router` pipeline on (spec.md §7).

use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use futures::{Sink, Stream};
use pin_project_lite::pin_project;
use tokio::net::UdpSocket;
use tokio_util::udp::UdpFramed;

use crate::codec::RakNetCodec;
use crate::errors::CodecError;
use crate::packet::Packet;

pub type Datagram = (Packet, SocketAddr);

/// Anything the client can send framed packets through and receive them
/// from. Implemented for [`UdpFramed<RakNetCodec>`] via the blanket impl
/// below; tests substitute an in-memory channel pair instead of binding a
/// real socket.
pub trait Endpoint:
    Sink<Datagram, Error = CodecError> + Stream<Item = Result<Datagram, CodecError>> + Unpin + Send
{
}

impl<T> Endpoint for T where
    T: Sink<Datagram, Error = CodecError> + Stream<Item = Result<Datagram, CodecError>> + Unpin + Send
{
}

pin_project! {
    /// A bound UDP socket framed with [`RakNetCodec`].
    pub struct UdpEndpoint {
        #[pin]
        inner: UdpFramed<RakNetCodec, UdpSocket>,
    }
}

impl UdpEndpoint {
    pub async fn bind(local_addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local_addr).await?;
        socket.set_broadcast(true)?;
        Ok(UdpEndpoint {
            inner: UdpFramed::new(socket, RakNetCodec),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.get_ref().local_addr()
    }
}

impl Stream for UdpEndpoint {
    type Item = Result<Datagram, CodecError>;

    fn poll_next(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

impl Sink<Datagram> for UdpEndpoint {
    type Error = CodecError;

    fn poll_ready(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_ready(cx)
    }

    fn start_send(self: std::pin::Pin<&mut Self>, item: Datagram) -> Result<(), Self::Error> {
        self.project().inner.start_send(item)
    }

    fn poll_flush(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_close(cx)
    }
}
