//! The connected-phase session: the reliability engine plus keepalive and
//! idle-timeout bookkeeping. Holds no I/O of its own — the client façade
//! owns the socket and drives `on_datagram`/`tick`, matching the
//! state-without-transport split `sauoro-amethyst::raknet::session` uses.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::packet::{Ack, CustomPacket, Reliability};
use crate::reliability::{Delivery, Engine, OutgoingBatch, DEFAULT_RESEND_TIMEOUT};

/// A session with no traffic at all for this long is considered dead.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// How often an idle session sends a keepalive ping to the peer.
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(2000);

/// Reserved channel and first bytes used for the keepalive payload. Upstream
/// RakNet has a dedicated `ID_CONNECTED_PING`/`ID_CONNECTED_PONG` pair; this
/// client only needs the liveness signal, not the round-trip timestamp echo.
const KEEPALIVE_CHANNEL: u8 = 0;
const KEEPALIVE_PAYLOAD: &[u8] = &[0xfe];

pub struct Session {
    pub server_addr: SocketAddr,
    engine: Engine,
    last_received: Instant,
    last_keepalive_sent: Instant,
}

impl Session {
    pub fn new(server_addr: SocketAddr, engine: Engine, now: Instant) -> Self {
        Session {
            server_addr,
            engine,
            last_received: now,
            last_keepalive_sent: now,
        }
    }

    pub fn send(&mut self, reliability: Reliability, channel: u8, payload: Bytes) {
        self.engine.send(reliability, channel, payload);
    }

    /// Feeds one arriving datagram into the reliability engine and returns
    /// application payloads ready for delivery, in release order.
    pub fn on_datagram(&mut self, packet: CustomPacket, now: Instant) -> Vec<Delivery> {
        self.last_received = now;
        self.engine.on_datagram(packet)
    }

    pub fn on_ack(&mut self, ack: Ack) {
        self.engine.on_ack(ack);
    }

    pub fn on_nack(&mut self, nack: Ack) {
        self.engine.on_nack(nack);
    }

    /// True once the peer has been silent long enough that the session
    /// should be torn down.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.duration_since(self.last_received) >= SESSION_TIMEOUT
    }

    /// Advances the session for one tick: queues a keepalive once no
    /// inbound datagram has arrived for `KEEPALIVE_INTERVAL`, then flushes
    /// everything due to go out. `last_keepalive_sent` gates re-sends on the
    /// same interval so an idle connection gets one keepalive per interval,
    /// not one per tick.
    pub fn tick(&mut self, now: Instant) -> OutgoingBatch {
        let inbound_silent = now.duration_since(self.last_received) >= KEEPALIVE_INTERVAL;
        let keepalive_due = now.duration_since(self.last_keepalive_sent) >= KEEPALIVE_INTERVAL;
        if inbound_silent && keepalive_due {
            self.engine.send(
                Reliability::Unreliable,
                KEEPALIVE_CHANNEL,
                Bytes::from_static(KEEPALIVE_PAYLOAD),
            );
            self.last_keepalive_sent = now;
        }
        self.engine.update(now, DEFAULT_RESEND_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::Engine;

    fn session_at(now: Instant) -> Session {
        Session::new("127.0.0.1:19132".parse().unwrap(), Engine::new(1200), now)
    }

    #[test]
    fn idle_session_is_not_timed_out_immediately() {
        let t0 = Instant::now();
        let session = session_at(t0);
        assert!(!session.is_timed_out(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn silence_past_timeout_marks_session_dead() {
        let t0 = Instant::now();
        let session = session_at(t0);
        assert!(session.is_timed_out(t0 + SESSION_TIMEOUT + Duration::from_millis(1)));
    }

    #[test]
    fn receiving_a_datagram_resets_the_timeout_clock() {
        let t0 = Instant::now();
        let mut session = session_at(t0);
        let t1 = t0 + Duration::from_secs(8);
        session.on_datagram(
            CustomPacket {
                sequence: crate::packet::Seq24(0),
                messages: vec![],
            },
            t1,
        );
        assert!(!session.is_timed_out(t1 + Duration::from_secs(8)));
    }

    #[test]
    fn tick_sends_keepalive_once_idle_interval_elapses() {
        let t0 = Instant::now();
        let mut session = session_at(t0);
        assert!(session.tick(t0).datagrams.is_empty());
        let later = t0 + KEEPALIVE_INTERVAL;
        assert!(!session.tick(later).datagrams.is_empty());
    }
}
