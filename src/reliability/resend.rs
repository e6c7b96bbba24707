//! Tracks every outgoing datagram that carried reliable messages, so the
//! whole bundle can be retransmitted on a NACK or after its resend timeout
//! elapses. RakNet's ACK/NACK acknowledge datagram sequence numbers, not
//! individual message indices, so the map is keyed by the datagram's
//! [`Seq24`] — mirroring `gzachrisson-bedroxide::raknet::reliability_layer`'s
//! `acknowledge_handler`, adapted to this crate's message model.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::packet::{EncapsulatedMessage, Seq24};

/// Default time to wait for an ACK before assuming the datagram was lost.
/// RTT-adaptive backoff is a non-goal (spec.md §3 "congestion control").
pub const DEFAULT_RESEND_TIMEOUT: Duration = Duration::from_millis(1500);

struct Entry {
    messages: Vec<EncapsulatedMessage>,
    sent_at: Instant,
}

/// Outstanding reliable datagrams, keyed by the datagram sequence number
/// they were sent with.
#[derive(Default)]
pub struct ResendMap {
    entries: BTreeMap<u32, Entry>,
}

impl ResendMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins tracking a sent datagram. A no-op if `messages` is empty —
    /// an all-unreliable datagram needs no resend bookkeeping.
    pub fn track(&mut self, sequence: Seq24, messages: Vec<EncapsulatedMessage>, now: Instant) {
        if messages.is_empty() {
            return;
        }
        self.entries.insert(sequence.0, Entry { messages, sent_at: now });
    }

    /// Drops an acknowledged datagram. Acking an untracked or
    /// already-removed sequence is a no-op.
    pub fn ack(&mut self, sequence: Seq24) {
        self.entries.remove(&sequence.0);
    }

    /// Returns the messages that must be resent immediately because the
    /// remote explicitly NACKed this datagram sequence. The entry is
    /// removed — the caller repacks the messages into a fresh datagram
    /// with a new sequence number and re-tracks them under that one.
    pub fn take_nacked(&mut self, sequence: Seq24) -> Option<Vec<EncapsulatedMessage>> {
        self.entries.remove(&sequence.0).map(|e| e.messages)
    }

    /// Returns every tracked bundle whose resend timeout has elapsed as of
    /// `now`, removing them — same re-tracking contract as
    /// [`take_nacked`](Self::take_nacked).
    pub fn take_expired(&mut self, now: Instant, timeout: Duration) -> Vec<Vec<EncapsulatedMessage>> {
        let expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.sent_at) >= timeout)
            .map(|(seq, _)| *seq)
            .collect();
        expired
            .into_iter()
            .filter_map(|seq| self.entries.remove(&seq).map(|e| e.messages))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
