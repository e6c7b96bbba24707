//! The public façade: one socket, at most one active session, and an
//! owned discovery bus. `Client::run` is the event loop a caller drives;
//! `connect`/`disconnect`/`send` mutate its state directly rather than
//! going through message-passing, since the session lives in a plain
//! `Option<Session>` owned by whichever task holds the `Client` — no
//! shared/volatile session field to synchronize (spec.md §9, "volatile
//! session field" redesign flag).

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::SinkExt;
use log::{debug, trace, warn};
use tokio::sync::watch;

use crate::discovery::{DiscoveryBus, DiscoveryMode, PongOutcome, Tick};
use crate::endpoint::{Endpoint, UdpEndpoint};
use crate::errors::{ClientError, DisconnectReason};
use crate::guid::new_guid;
use crate::handshake;
use crate::listener::Listener;
use crate::packet::{
    login::DisconnectNotification, Packet, Reliability, UnconnectedPacket,
};
use crate::reliability::Delivery;
use crate::session::Session;

/// Wire protocol version this client speaks; servers report
/// [`UnconnectedPacket::IncompatibleProtocolVersion`] when it doesn't match.
pub const PROTOCOL_VERSION: u8 = 11;

/// How often the event loop wakes up to drive keepalives, resends and
/// discovery pings even with no traffic arriving.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Default broadcast port for discovery pings, matching upstream RakNet's
/// default server port.
const DEFAULT_DISCOVERY_PORT: u16 = 19132;

pub struct Client<E: Endpoint = UdpEndpoint> {
    endpoint: E,
    local_guid: u64,
    created_at: Instant,
    session: Option<Session>,
    discovery: DiscoveryBus,
    discovery_mode: DiscoveryMode,
    discovery_port: u16,
    listener: Option<Box<dyn Listener>>,
    cancel_tx: watch::Sender<bool>,
}

impl Client<UdpEndpoint> {
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, ClientError> {
        let endpoint = UdpEndpoint::bind(local_addr)
            .await
            .map_err(|source| ClientError::TransportError { addr: None, source })?;
        Ok(Self::with_endpoint(endpoint))
    }
}

impl<E: Endpoint> Client<E> {
    pub fn with_endpoint(endpoint: E) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Client {
            endpoint,
            local_guid: new_guid(),
            created_at: Instant::now(),
            session: None,
            discovery: DiscoveryBus::new(),
            discovery_mode: DiscoveryMode::None,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            listener: None,
            cancel_tx,
        }
    }

    pub fn set_listener(&mut self, listener: impl Listener + 'static) {
        self.listener = Some(Box::new(listener));
    }

    /// Sets the discovery mode. Enabling discovery (anything but
    /// [`DiscoveryMode::None`]) before a listener is installed raises
    /// [`ClientError::NoListener`].
    pub fn set_discovery_mode(&mut self, mode: DiscoveryMode) -> Result<(), ClientError> {
        if mode != DiscoveryMode::None && self.listener.is_none() {
            return Err(ClientError::NoListener);
        }
        self.discovery_mode = mode;
        Ok(())
    }

    /// Sets the UDP port discovery pings are broadcast to. Defaults to
    /// RakNet's conventional server port.
    pub fn set_discovery_port(&mut self, port: u16) {
        self.discovery_port = port;
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Runs the offline handshake against `server_addr` and installs the
    /// resulting session. Any previous session is dropped without a
    /// graceful disconnect — call [`disconnect`](Self::disconnect) first
    /// if one is active.
    pub async fn connect(&mut self, server_addr: SocketAddr) -> Result<(), ClientError> {
        if self.listener.is_none() {
            return Err(ClientError::NoListener);
        }
        let _ = self.cancel_tx.send(false);
        let mut cancel_rx = self.cancel_tx.subscribe();

        let outcome = match handshake::run(
            &mut self.endpoint,
            server_addr,
            self.local_guid,
            PROTOCOL_VERSION,
            &mut cancel_rx,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(ClientError::ConnectionCancelled) => {
                self.dispatch_disconnect(server_addr, DisconnectReason::Cancelled);
                return Err(ClientError::ConnectionCancelled);
            }
            Err(ClientError::ProtocolMismatch) => {
                self.dispatch_disconnect(server_addr, DisconnectReason::ProtocolMismatch);
                return Err(ClientError::ProtocolMismatch);
            }
            Err(ClientError::TransportError { addr, source }) => {
                self.dispatch_disconnect(server_addr, DisconnectReason::TransportError);
                return Err(ClientError::TransportError { addr, source });
            }
            Err(e) => return Err(e),
        };

        debug!(
            "connected to {} (mtu={}, server_guid={:#x})",
            server_addr, outcome.mtu, outcome.server_guid
        );
        self.session = Some(Session::new(server_addr, outcome.engine, Instant::now()));
        self.dispatch_connect(server_addr);
        Ok(())
    }

    /// Sends a best-effort disconnect notification and clears the session.
    /// Also trips the cancellation signal a concurrent in-flight `connect`
    /// watches, so a caller driving `connect` and `disconnect` from separate
    /// tasks can abort the handshake.
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        let _ = self.cancel_tx.send(true);

        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let server_addr = session.server_addr;

        let mut body = bytes::BytesMut::new();
        DisconnectNotification.write(&mut body);
        session.send(Reliability::ReliableOrdered, 0, body.freeze());
        let batch = session.tick(Instant::now());
        for datagram in batch.datagrams {
            self.send_packet(Packet::Custom(datagram), server_addr).await;
        }

        self.dispatch_disconnect(server_addr, DisconnectReason::ClientRequest);
        Ok(())
    }

    /// Queues `payload` for delivery to the connected server.
    pub fn send(&mut self, reliability: Reliability, channel: u8, payload: Bytes) -> Result<(), ClientError> {
        match &mut self.session {
            Some(session) => {
                session.send(reliability, channel, payload);
                Ok(())
            }
            None => Err(ClientError::NotConnected),
        }
    }

    /// Drives the event loop for one `tick`: flushes outgoing session
    /// traffic, fires discovery pings, and processes every datagram
    /// currently queued on the socket without blocking further.
    ///
    /// Intended to be called in a loop (typically via [`Client::run`]);
    /// exposed separately so tests can step it deterministically.
    pub async fn tick_once(&mut self, now: Instant) -> Result<(), ClientError> {
        self.drive_discovery(now).await?;
        self.drive_session(now).await?;
        Ok(())
    }

    async fn drive_discovery(&mut self, now: Instant) -> Result<(), ClientError> {
        if self.discovery_mode == DiscoveryMode::None {
            return Ok(());
        }
        let (tick, forgotten) = self.discovery.tick(now);
        for server in forgotten {
            let addr = server.address;
            self.dispatch("on_server_forgotten", move |l| l.on_server_forgotten(addr));
        }
        if matches!(tick, Tick::SendPing) {
            let client_timestamp = now.duration_since(self.created_at).as_millis() as i64;
            let ping = match self.discovery_mode {
                DiscoveryMode::AllConnections => UnconnectedPacket::Ping {
                    client_timestamp,
                    client_guid: self.local_guid,
                },
                DiscoveryMode::OpenConnectionsOnly => UnconnectedPacket::PingOpenConnections {
                    client_timestamp,
                    client_guid: self.local_guid,
                },
                DiscoveryMode::None => return Ok(()),
            };
            let broadcast = SocketAddr::new(std::net::Ipv4Addr::BROADCAST.into(), self.discovery_port);
            self.send_packet(Packet::Unconnected(ping), broadcast).await;
        }
        Ok(())
    }

    async fn drive_session(&mut self, now: Instant) -> Result<(), ClientError> {
        let Some(session) = &mut self.session else {
            return Ok(());
        };
        if session.is_timed_out(now) {
            let server_addr = session.server_addr;
            self.session = None;
            self.dispatch_disconnect(server_addr, DisconnectReason::Timeout);
            return Ok(());
        }

        let batch = session.tick(now);
        let server_addr = session.server_addr;
        if let Some(ack) = batch.ack {
            self.send_packet(Packet::Ack(ack), server_addr).await;
        }
        if let Some(nack) = batch.nack {
            self.send_packet(Packet::Nack(nack), server_addr).await;
        }
        for datagram in batch.datagrams {
            self.send_packet(Packet::Custom(datagram), server_addr).await;
        }
        Ok(())
    }

    /// Sends one packet over the endpoint, reporting a failure through
    /// [`Listener::on_handler_exception`] instead of discarding it.
    async fn send_packet(&mut self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.endpoint.send((packet, addr)).await {
            warn!("send to {addr} failed: {e}");
            self.report_exception("endpoint send", e.to_string());
        }
    }

    /// Processes one already-received `(packet, from)` pair. Split out
    /// from the socket read so both the live event loop and tests can
    /// feed packets through the same routing logic.
    pub fn handle_incoming(&mut self, packet: Packet, from: SocketAddr, now: Instant) {
        match packet {
            Packet::Unconnected(UnconnectedPacket::Pong {
                server_guid,
                identifier,
                ..
            }) => self.handle_pong(from, server_guid, identifier, now),
            Packet::Unconnected(_) => {
                trace!("ignoring unconnected packet from {from} outside discovery/handshake");
            }
            Packet::Custom(datagram) => self.handle_custom(datagram, from, now),
            Packet::Ack(ack) => {
                if self.session_from(from) {
                    self.session.as_mut().unwrap().on_ack(ack);
                }
            }
            Packet::Nack(nack) => {
                if self.session_from(from) {
                    self.session.as_mut().unwrap().on_nack(nack);
                }
            }
        }
    }

    fn session_from(&self, from: SocketAddr) -> bool {
        self.session.as_ref().map(|s| s.server_addr) == Some(from)
    }

    fn handle_pong(&mut self, from: SocketAddr, server_guid: u64, identifier: Bytes, now: Instant) {
        if self.discovery_mode == DiscoveryMode::None {
            return;
        }
        let outcome = self.discovery.observe_pong(from, server_guid, identifier, now);
        if outcome == PongOutcome::Unchanged {
            return;
        }
        let Some(server) = self.discovery.servers().find(|s| s.address == from).cloned() else {
            return;
        };
        match outcome {
            PongOutcome::Discovered => {
                self.dispatch("on_server_discovered", move |l| l.on_server_discovered(&server));
            }
            PongOutcome::IdentifierChanged => {
                self.dispatch("on_server_identifier_update", move |l| {
                    l.on_server_identifier_update(&server)
                });
            }
            PongOutcome::Unchanged => unreachable!(),
        }
    }

    fn handle_custom(&mut self, datagram: crate::packet::CustomPacket, from: SocketAddr, now: Instant) {
        if !self.session_from(from) {
            trace!("dropping custom datagram from unrelated peer {from}");
            return;
        }
        let session = self.session.as_mut().unwrap();
        let deliveries = session.on_datagram(datagram, now);
        for delivery in deliveries {
            if delivery.payload.first() == Some(&crate::packet::PacketId::DISCONNECT_NOTIFICATION) {
                self.session = None;
                self.dispatch_disconnect(from, DisconnectReason::ServerOffline);
                return;
            }
            let Delivery { payload, reliability, channel } = delivery;
            self.dispatch("on_packet_receive", move |l| {
                l.on_packet_receive(from, payload, reliability, channel)
            });
        }
    }

    fn dispatch_connect(&mut self, server_addr: SocketAddr) {
        self.dispatch("on_connect", move |l| l.on_connect(server_addr));
    }

    fn dispatch_disconnect(&mut self, server_addr: SocketAddr, reason: DisconnectReason) {
        self.dispatch("on_disconnect", move |l| l.on_disconnect(server_addr, reason));
    }

    /// Invokes one listener callback, catching a panic inside it so one
    /// misbehaving handler can't take down the event loop, and reporting it
    /// through [`Listener::on_handler_exception`].
    fn dispatch<F: FnOnce(&mut dyn Listener)>(&mut self, context: &str, f: F) {
        let result = match &mut self.listener {
            Some(listener) => std::panic::catch_unwind(AssertUnwindSafe(|| f(&mut **listener))),
            None => return,
        };
        if let Err(payload) = result {
            self.report_exception(context, panic_message(&payload));
        }
    }

    fn report_exception(&mut self, context: &str, message: String) {
        if let Some(listener) = &mut self.listener {
            let _ = std::panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_handler_exception(context, message)
            }));
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked with a non-string payload".to_string()
    }
}

impl Client<UdpEndpoint> {
    /// Runs forever, pumping incoming datagrams and driving [`tick_once`]
    /// on a fixed interval. Returns only on a transport error reading the
    /// socket; session and handshake failures are surfaced through the
    /// listener instead.
    ///
    /// [`tick_once`]: Client::tick_once
    pub async fn run(&mut self) -> Result<(), ClientError> {
        use futures::StreamExt;

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_once(Instant::now()).await?;
                }
                next = self.endpoint.next() => {
                    match next {
                        Some(Ok((packet, from))) => self.handle_incoming(packet, from, Instant::now()),
                        Some(Err(e)) => debug!("dropping malformed datagram from peer: {e}"),
                        None => {
                            return Err(ClientError::TransportError {
                                addr: None,
                                source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "endpoint closed"),
                            });
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Datagram;
    use futures::channel::mpsc;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// An in-memory stand-in for a UDP socket: frames sent through it land
    /// directly on `inbox` instead of going over the network, so tests can
    /// drive `Client` deterministically.
    struct MockEndpoint {
        outbound: mpsc::UnboundedSender<Datagram>,
        inbound: mpsc::UnboundedReceiver<Datagram>,
    }

    impl futures::Stream for MockEndpoint {
        type Item = Result<Datagram, crate::errors::CodecError>;
        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.inbound).poll_next(cx).map(|opt| opt.map(Ok))
        }
    }

    impl futures::Sink<Datagram> for MockEndpoint {
        type Error = crate::errors::CodecError;
        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn start_send(self: Pin<&mut Self>, item: Datagram) -> Result<(), Self::Error> {
            let _ = self.outbound.unbounded_send(item);
            Ok(())
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Builds a client plus a handle to drain whatever it sends.
    fn test_client() -> (Client<MockEndpoint>, mpsc::UnboundedReceiver<Datagram>) {
        let (out_tx, out_rx) = mpsc::unbounded();
        let (_in_tx, in_rx) = mpsc::unbounded();
        let endpoint = MockEndpoint {
            outbound: out_tx,
            inbound: in_rx,
        };
        (Client::with_endpoint(endpoint), out_rx)
    }

    #[tokio::test]
    async fn send_without_a_session_is_rejected() {
        let (mut client, _out_rx) = test_client();
        let err = client
            .send(Reliability::Reliable, 0, Bytes::from_static(b"hi"))
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn discovery_tick_broadcasts_a_ping_once_enabled() {
        let (mut client, mut out_rx) = test_client();
        client.set_listener(RecordingListener::default());
        client.set_discovery_mode(DiscoveryMode::OpenConnectionsOnly).unwrap();
        client.tick_once(Instant::now()).await.unwrap();

        let (packet, _addr) = out_rx.try_next().unwrap().unwrap();
        assert!(matches!(
            packet,
            Packet::Unconnected(UnconnectedPacket::PingOpenConnections { .. })
        ));
    }

    #[tokio::test]
    async fn enabling_discovery_without_a_listener_is_rejected() {
        let (mut client, _out_rx) = test_client();
        let err = client.set_discovery_mode(DiscoveryMode::AllConnections).unwrap_err();
        assert!(matches!(err, ClientError::NoListener));
    }

    #[tokio::test]
    async fn connect_without_a_listener_is_rejected() {
        let (mut client, _out_rx) = test_client();
        let err = client.connect("127.0.0.1:19132".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, ClientError::NoListener));
    }

    #[tokio::test]
    async fn disabled_discovery_sends_nothing_on_tick() {
        let (mut client, mut out_rx) = test_client();
        client.tick_once(Instant::now()).await.unwrap();
        assert!(out_rx.try_next().is_err());
    }

    #[derive(Default)]
    struct RecordingListener {
        received: std::sync::Arc<parking_lot::Mutex<Vec<Bytes>>>,
    }

    impl Listener for RecordingListener {
        fn on_packet_receive(
            &mut self,
            _server: SocketAddr,
            payload: Bytes,
            _reliability: Reliability,
            _channel: u8,
        ) {
            self.received.lock().push(payload);
        }
    }

    #[tokio::test]
    async fn handle_incoming_routes_custom_datagram_to_listener() {
        let (mut client, _out_rx) = test_client();
        let server_addr: SocketAddr = "127.0.0.1:19132".parse().unwrap();
        client.session = Some(Session::new(
            server_addr,
            crate::reliability::Engine::new(1200),
            Instant::now(),
        ));
        let received = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        client.set_listener(RecordingListener {
            received: received.clone(),
        });

        let mut sender_engine = crate::reliability::Engine::new(1200);
        sender_engine.send(Reliability::Unreliable, 0, Bytes::from_static(b"payload"));
        let batch = sender_engine.update(Instant::now(), crate::reliability::DEFAULT_RESEND_TIMEOUT);
        let datagram = batch.datagrams.into_iter().next().unwrap();

        client.handle_incoming(Packet::Custom(datagram), server_addr, Instant::now());

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].as_ref(), b"payload");
    }
}
