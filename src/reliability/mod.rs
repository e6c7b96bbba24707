//! The reliability engine: wraps resend tracking, ordering/sequencing and
//! split reassembly behind the explicit `send` / `on_datagram` / `on_ack` /
//! `on_nack` / `update` contract spec.md §4.2 calls for, instead of the
//! pinned `Sink` adapter `CoolLoong-raknet-rs::guard::OutgoingGuard` uses.
//! The resend/flush/ack-nack ordering those adapters encode is mirrored
//! here so the logic stays grounded in the teacher's design even though the
//! shape is a plain struct the session can drive directly and test without
//! a runtime (spec.md §9, "deterministic Engine test harness").

mod ordering;
mod resend;
mod split;

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::packet::{Ack, CustomPacket, EncapsulatedMessage, Reliability, Seq24, SplitInfo};

pub use resend::DEFAULT_RESEND_TIMEOUT;

/// Largest payload packed into a single unsplit message; conservative
/// fixed overhead budget for the worst-case encapsulation header
/// (flags + length + message index + order index/channel + split header).
const MESSAGE_HEADER_BUDGET: usize = 1 + 2 + 3 + 3 + 1 + 10;

/// Everything the engine wants flushed onto the wire this tick.
#[derive(Debug, Default)]
pub struct OutgoingBatch {
    pub ack: Option<Ack>,
    pub nack: Option<Ack>,
    pub datagrams: Vec<CustomPacket>,
}

/// One application payload released from the engine, with the reliability
/// class and channel it arrived on so the caller can hand both to the
/// listener instead of just the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: Bytes,
    pub reliability: Reliability,
    pub channel: u8,
}

pub struct Engine {
    mtu: usize,
    local_sequence: Seq24,
    next_message_index: Seq24,
    next_order_index: [u32; ordering::CHANNEL_COUNT],
    next_split_id: u16,

    resend: resend::ResendMap,
    ordering: ordering::OrderingState,
    split: split::SplitTable,

    highest_received: Option<Seq24>,
    missing: Vec<Seq24>,
    pending_ack: Vec<Seq24>,
    pending_nack: Vec<Seq24>,

    outbox: std::collections::VecDeque<EncapsulatedMessage>,
}

impl Engine {
    pub fn new(mtu: usize) -> Self {
        Engine {
            mtu,
            local_sequence: Seq24::ZERO,
            next_message_index: Seq24::ZERO,
            next_order_index: [0; ordering::CHANNEL_COUNT],
            next_split_id: 0,
            resend: resend::ResendMap::new(),
            ordering: ordering::OrderingState::new(),
            split: split::SplitTable::new(),
            highest_received: None,
            missing: Vec::new(),
            pending_ack: Vec::new(),
            pending_nack: Vec::new(),
            outbox: std::collections::VecDeque::new(),
        }
    }

    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }

    /// Queues a payload for sending, fragmenting it into multiple
    /// encapsulated messages if it would not fit one datagram.
    pub fn send(&mut self, reliability: Reliability, channel: u8, payload: Bytes) {
        let order_index = self.assign_order_index(reliability, channel);
        let budget = self.mtu.saturating_sub(MESSAGE_HEADER_BUDGET);
        if payload.len() <= budget || budget == 0 {
            self.enqueue_message(reliability, channel, order_index, None, payload);
            return;
        }

        let split_id = self.next_split_id;
        self.next_split_id = self.next_split_id.wrapping_add(1);
        let count = (payload.len() + budget - 1) / budget;
        for (index, chunk) in payload.chunks(budget).enumerate() {
            let split = SplitInfo {
                count: count as u32,
                id: split_id,
                index: index as u32,
            };
            self.enqueue_message(
                reliability,
                channel,
                order_index,
                Some(split),
                Bytes::copy_from_slice(chunk),
            );
        }
    }

    /// Every fragment of a split message shares one order index — RakNet
    /// orders the reassembled message, not the wire fragments — so this is
    /// assigned once per `send` call rather than per fragment.
    fn assign_order_index(&mut self, reliability: Reliability, channel: u8) -> Option<Seq24> {
        if !reliability.has_ordering_channel() {
            return None;
        }
        let slot = &mut self.next_order_index[channel as usize];
        let idx = Seq24(*slot);
        *slot = slot.wrapping_add(1);
        Some(idx)
    }

    fn enqueue_message(
        &mut self,
        reliability: Reliability,
        channel: u8,
        order_index: Option<Seq24>,
        split: Option<SplitInfo>,
        payload: Bytes,
    ) {
        let message_index = if reliability.is_reliable() {
            let idx = self.next_message_index;
            self.next_message_index = self.next_message_index.next();
            Some(idx)
        } else {
            None
        };

        self.outbox.push_back(EncapsulatedMessage {
            reliability,
            message_index,
            order_index,
            order_channel: channel,
            split,
            payload,
        });
    }

    /// Processes one arriving datagram: updates ack/nack bookkeeping and
    /// runs each message through split reassembly and ordering. Returns
    /// payloads ready for delivery to the caller, in release order.
    pub fn on_datagram(&mut self, packet: CustomPacket) -> Vec<Delivery> {
        if !self.note_arrival(packet.sequence) {
            // Duplicate or behind the known front: ack it but drop the
            // payloads, they were already delivered.
            return Vec::new();
        }

        let mut ready = Vec::new();
        for msg in packet.messages {
            let Some(reassembled) = (if msg.split.is_some() {
                self.split.accept(msg)
            } else {
                Some(msg)
            }) else {
                continue;
            };
            for delivered in self.ordering.accept(reassembled) {
                ready.push(Delivery {
                    reliability: delivered.reliability,
                    channel: delivered.order_channel,
                    payload: delivered.payload,
                });
            }
        }
        ready
    }

    /// Records an arriving datagram's sequence number for ack/gap tracking.
    /// Returns `false` if this sequence was already seen (a true duplicate
    /// or something behind the known front), in which case the caller must
    /// not dispatch its messages again.
    fn note_arrival(&mut self, sequence: Seq24) -> bool {
        self.pending_ack.push(sequence);

        if self.missing.iter().any(|&s| s == sequence) {
            // Fills a previously tracked gap; the front doesn't move.
            self.missing.retain(|&s| s != sequence);
            return true;
        }

        match self.highest_received {
            None => {
                self.highest_received = Some(sequence);
                true
            }
            Some(highest) if sequence == highest || !highest.is_ahead(sequence) => {
                // Duplicate or behind the known front; already delivered.
                false
            }
            Some(highest) => {
                let mut gap = highest.next();
                while gap != sequence {
                    self.missing.push(gap);
                    self.pending_nack.push(gap);
                    gap = gap.next();
                }
                self.highest_received = Some(sequence);
                true
            }
        }
    }

    pub fn on_ack(&mut self, ack: Ack) {
        for seq in ack.iter_sequences() {
            self.resend.ack(seq);
        }
    }

    pub fn on_nack(&mut self, nack: Ack) {
        for seq in nack.iter_sequences() {
            if let Some(messages) = self.resend.take_nacked(seq) {
                for m in messages {
                    self.outbox.push_front(m);
                }
            }
        }
    }

    /// Builds everything due to go out this tick: queued acks/nacks for
    /// received datagrams, expired resends, and freshly queued sends,
    /// packed into MTU-budgeted datagrams.
    pub fn update(&mut self, now: Instant, timeout: Duration) -> OutgoingBatch {
        for messages in self.resend.take_expired(now, timeout) {
            for m in messages {
                self.outbox.push_front(m);
            }
        }

        let ack_budget = self.mtu.saturating_sub(4);
        let (ack, ack_consumed) = Ack::extend_from(&self.pending_ack, ack_budget);
        self.pending_ack.drain(..ack_consumed);

        let (nack, nack_consumed) = Ack::extend_from(&self.pending_nack, ack_budget);
        self.pending_nack.drain(..nack_consumed);

        let datagrams = self.flush_datagrams(now);

        OutgoingBatch {
            ack: if ack.records.is_empty() { None } else { Some(ack) },
            nack: if nack.records.is_empty() { None } else { Some(nack) },
            datagrams,
        }
    }

    fn flush_datagrams(&mut self, now: Instant) -> Vec<CustomPacket> {
        let mut datagrams = Vec::new();
        while !self.outbox.is_empty() {
            let mut messages = Vec::new();
            let mut used = 0usize;
            while let Some(front) = self.outbox.front() {
                let size = front.wire_size();
                if used + size > self.mtu && !messages.is_empty() {
                    break;
                }
                used += size;
                messages.push(self.outbox.pop_front().unwrap());
                if used >= self.mtu {
                    break;
                }
            }
            if messages.is_empty() {
                // A single message exceeds the MTU on its own; this should
                // not happen given `send`'s fragmentation budget, but avoid
                // looping forever if it somehow does.
                break;
            }

            let sequence = self.local_sequence;
            self.local_sequence = self.local_sequence.next();

            let reliable: Vec<EncapsulatedMessage> = messages
                .iter()
                .filter(|m| m.reliability.is_reliable())
                .cloned()
                .collect();
            self.resend.track(sequence, reliable, now);

            datagrams.push(CustomPacket { sequence, messages });
        }
        datagrams
    }

    pub fn has_pending_resends(&self) -> bool {
        !self.resend.is_empty()
    }
}
