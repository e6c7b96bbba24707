//! Client-side RakNet datagram transport.
//!
//! Owns a UDP socket and speaks just enough of the protocol to discover
//! LAN servers, complete the offline handshake, and exchange reliable,
//! ordered and sequenced application payloads with one connected peer.
//! Server-side session management, congestion control and encrypted
//! handshakes are out of scope — see [`client::Client`] for the entry
//! point.

pub mod client;
pub mod codec;
pub mod discovery;
pub mod endpoint;
pub mod errors;
mod guid;
pub mod listener;
pub mod packet;
pub mod reliability;
pub mod session;

mod handshake;

pub use client::{Client, PROTOCOL_VERSION};
pub use discovery::{DiscoveredServer, DiscoveryMode};
pub use endpoint::{Endpoint, UdpEndpoint};
pub use errors::{ClientError, CodecError, DisconnectReason};
pub use listener::Listener;
pub use packet::Reliability;
