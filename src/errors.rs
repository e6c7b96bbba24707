use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised while decoding bytes off the wire.
///
/// Every decode function in [`crate::packet`] returns this error instead of
/// panicking; callers at the receive boundary log and drop the offending
/// datagram rather than propagate it (see `ClientError` for what does cross
/// the public API).
#[derive(Debug, Error, Clone)]
pub enum CodecError {
    #[error("truncated packet at offset {offset}")]
    Truncated { offset: usize },
    #[error("magic cookie mismatch")]
    BadMagic,
    #[error("invalid reliability id {0}")]
    InvalidReliability(u8),
    #[error("invalid ack/nak record type {0}")]
    InvalidRecordType(u8),
    #[error("invalid address version tag {0}")]
    InvalidAddressVersion(u8),
    #[error("unknown packet id {0:#04x}")]
    UnknownPacketId(u8),
    #[error("ack record count {0} exceeds limit")]
    AckCountExceeded(u32),
    #[error("empty datagram")]
    EmptyDatagram,
    #[error("transport io error: {0}")]
    Io(std::sync::Arc<std::io::Error>),
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Io(std::sync::Arc::new(e))
    }
}

impl PartialEq for CodecError {
    fn eq(&self, other: &Self) -> bool {
        use CodecError::*;
        match (self, other) {
            (Truncated { offset: a }, Truncated { offset: b }) => a == b,
            (BadMagic, BadMagic) => true,
            (InvalidReliability(a), InvalidReliability(b)) => a == b,
            (InvalidRecordType(a), InvalidRecordType(b)) => a == b,
            (InvalidAddressVersion(a), InvalidAddressVersion(b)) => a == b,
            (UnknownPacketId(a), UnknownPacketId(b)) => a == b,
            (AckCountExceeded(a), AckCountExceeded(b)) => a == b,
            (EmptyDatagram, EmptyDatagram) => true,
            (Io(a), Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}
impl Eq for CodecError {}

/// Errors surfaced to the caller of public [`crate::client::Client`] entry points.
///
/// Decode failures never appear here: they are dropped silently at the
/// receive boundary per spec. This enum only carries failures that a caller
/// needs to react to synchronously.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no listener installed before this call")]
    NoListener,
    #[error("server did not respond to the handshake")]
    ServerOffline,
    #[error("server reported an incompatible protocol version")]
    ProtocolMismatch,
    #[error("connection attempt was cancelled")]
    ConnectionCancelled,
    #[error("transport error talking to {addr:?}: {source}")]
    TransportError {
        addr: Option<SocketAddr>,
        #[source]
        source: std::io::Error,
    },
    #[error("no active session")]
    NotConnected,
}

/// Reason a session or handshake ended, surfaced via listener callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientRequest,
    Timeout,
    ServerOffline,
    ProtocolMismatch,
    Cancelled,
    TransportError,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::ClientRequest => "client request",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::ServerOffline => "server offline",
            DisconnectReason::ProtocolMismatch => "protocol mismatch",
            DisconnectReason::Cancelled => "cancelled",
            DisconnectReason::TransportError => "transport error",
        };
        f.write_str(s)
    }
}
