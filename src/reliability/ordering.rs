//! Per-channel ordering and sequencing, mirroring
//! `gzachrisson-bedroxide`'s fixed-size per-channel arrays rather than a
//! `HashMap<u8, _>` — RakNet only ever defines 32 ordering channels, so the
//! channel id indexes straight into an array (spec.md §4 data model note).

use std::collections::BTreeMap;

use crate::packet::{EncapsulatedMessage, Seq24};

pub const CHANNEL_COUNT: usize = 32;

#[derive(Default)]
struct ChannelState {
    /// Next order index this channel expects to release, for ordered
    /// traffic. Out-of-order arrivals buffer here until the gap fills.
    next_ordered: u32,
    buffered: BTreeMap<u32, EncapsulatedMessage>,
    /// Highest sequenced index delivered so far; anything not strictly
    /// newer is dropped rather than buffered.
    highest_sequenced: Option<u32>,
}

/// Reorders and reassembles ordered/sequenced traffic across all 32
/// channels. Produced payloads are handed to callers in the order this
/// returns them, which is release order, not arrival order.
pub struct OrderingState {
    channels: Vec<ChannelState>,
}

impl Default for OrderingState {
    fn default() -> Self {
        let mut channels = Vec::with_capacity(CHANNEL_COUNT);
        channels.resize_with(CHANNEL_COUNT, ChannelState::default);
        OrderingState { channels }
    }
}

impl OrderingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one fully-reassembled (non-split) message through ordering.
    /// Returns the messages now ready for delivery, in release order: for
    /// `ReliableOrdered` this may be more than one if buffered successors
    /// just became releasable; for sequenced classes it is at most the
    /// message itself.
    pub fn accept(&mut self, msg: EncapsulatedMessage) -> Vec<EncapsulatedMessage> {
        if msg.reliability.is_ordered() {
            self.accept_ordered(msg)
        } else if msg.reliability.is_sequenced() {
            self.accept_sequenced(msg).into_iter().collect()
        } else {
            vec![msg]
        }
    }

    fn accept_ordered(&mut self, msg: EncapsulatedMessage) -> Vec<EncapsulatedMessage> {
        let channel = &mut self.channels[msg.order_channel as usize];
        let Some(order_index) = msg.order_index else {
            return vec![msg];
        };
        let idx = order_index.0;
        if idx < channel.next_ordered {
            return Vec::new(); // duplicate or already released
        }
        channel.buffered.insert(idx, msg);

        let mut ready = Vec::new();
        while let Some(next) = channel.buffered.remove(&channel.next_ordered) {
            channel.next_ordered = channel.next_ordered.wrapping_add(1);
            ready.push(next);
        }
        ready
    }

    fn accept_sequenced(&mut self, msg: EncapsulatedMessage) -> Option<EncapsulatedMessage> {
        let channel = &mut self.channels[msg.order_channel as usize];
        let Some(order_index) = msg.order_index else {
            return Some(msg);
        };
        let idx = order_index.0;
        let is_newer = match channel.highest_sequenced {
            Some(h) => Seq24(h).is_ahead(Seq24(idx)),
            None => true,
        };
        if is_newer {
            channel.highest_sequenced = Some(idx);
            Some(msg)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Reliability;
    use bytes::Bytes;

    fn ordered(channel: u8, idx: u32, tag: &'static str) -> EncapsulatedMessage {
        EncapsulatedMessage {
            reliability: Reliability::ReliableOrdered,
            message_index: Some(Seq24(idx)),
            order_index: Some(Seq24(idx)),
            order_channel: channel,
            split: None,
            payload: Bytes::from_static(tag.as_bytes()),
        }
    }

    fn sequenced(channel: u8, idx: u32, tag: &'static str) -> EncapsulatedMessage {
        EncapsulatedMessage {
            reliability: Reliability::ReliableSequenced,
            message_index: Some(Seq24(idx)),
            order_index: Some(Seq24(idx)),
            order_channel: channel,
            split: None,
            payload: Bytes::from_static(tag.as_bytes()),
        }
    }

    #[test]
    fn ordered_releases_in_order_after_gap_fills() {
        let mut state = OrderingState::new();
        assert!(state.accept(ordered(0, 1, "b")).is_empty());
        assert!(state.accept(ordered(0, 2, "c")).is_empty());
        let released = state.accept(ordered(0, 0, "a"));
        let tags: Vec<_> = released.iter().map(|m| m.payload.as_ref()).collect();
        assert_eq!(tags, vec![b"a".as_ref(), b"b".as_ref(), b"c".as_ref()]);
    }

    #[test]
    fn ordered_drops_stale_duplicates() {
        let mut state = OrderingState::new();
        state.accept(ordered(0, 0, "a"));
        assert!(state.accept(ordered(0, 0, "dup")).is_empty());
    }

    #[test]
    fn sequenced_drops_anything_not_newer() {
        let mut state = OrderingState::new();
        assert!(state.accept(sequenced(1, 5, "newest")).is_some());
        assert!(state.accept(sequenced(1, 3, "stale")).is_none());
        assert!(state.accept(sequenced(1, 6, "newer")).is_some());
    }

    #[test]
    fn channels_are_independent() {
        let mut state = OrderingState::new();
        assert!(!state.accept(ordered(0, 0, "a")).is_empty());
        assert!(!state.accept(ordered(1, 0, "a")).is_empty());
    }
}
