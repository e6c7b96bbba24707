//! Callback surface the client drives. Implemented by the caller to react
//! to discovery events, connection lifecycle, and incoming application
//! payloads, mirroring the listener-trait shape
//! `sauoro-amethyst::server::listener` uses on the server side.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::discovery::DiscoveredServer;
use crate::errors::DisconnectReason;
use crate::packet::Reliability;

/// Callbacks a [`crate::client::Client`] invokes as events occur. Every
/// method has a no-op default so implementors only override what they
/// care about.
pub trait Listener: Send {
    fn on_server_discovered(&mut self, _server: &DiscoveredServer) {}

    fn on_server_identifier_update(&mut self, _server: &DiscoveredServer) {}

    fn on_server_forgotten(&mut self, _addr: SocketAddr) {}

    fn on_connect(&mut self, _server: SocketAddr) {}

    fn on_disconnect(&mut self, _server: SocketAddr, _reason: DisconnectReason) {}

    fn on_packet_receive(
        &mut self,
        _server: SocketAddr,
        _payload: Bytes,
        _reliability: Reliability,
        _channel: u8,
    ) {
    }

    /// Invoked when a listener callback above panics; the panic is caught
    /// at the dispatch boundary so one misbehaving handler can't take down
    /// the client's event loop.
    fn on_handler_exception(&mut self, _context: &str, _message: String) {}
}
