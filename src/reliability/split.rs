//! Split-message reassembly. A message too large for one datagram arrives
//! as several [`EncapsulatedMessage`] fragments sharing a split id; this
//! table holds partial fragments until all of them have arrived, then
//! concatenates them back into one payload, grounded on
//! `Jyuggers-tokio-raknet`'s transport split-packet handling.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::packet::{EncapsulatedMessage, SplitInfo};

struct Partial {
    total: u32,
    channel: u8,
    fragments: HashMap<u32, Bytes>,
    template: EncapsulatedMessage,
}

/// Keyed by split id. RakNet split ids are per-sender u16s; this client
/// only ever reassembles one remote's traffic per session, so a flat map
/// keyed by id alone is sufficient (no sender-address disambiguation
/// needed at this layer).
#[derive(Default)]
pub struct SplitTable {
    partials: HashMap<u16, Partial>,
}

impl SplitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one fragment in. Returns `Some(message)` with `split` cleared
    /// and `payload` set to the reassembled bytes once every fragment for
    /// its split id has arrived.
    pub fn accept(&mut self, msg: EncapsulatedMessage) -> Option<EncapsulatedMessage> {
        let SplitInfo { count, id, index } = msg.split?;

        let partial = self.partials.entry(id).or_insert_with(|| Partial {
            total: count,
            channel: msg.order_channel,
            fragments: HashMap::new(),
            template: msg.clone(),
        });
        partial.fragments.insert(index, msg.payload.clone());

        if partial.fragments.len() < partial.total as usize {
            return None;
        }

        let partial = self.partials.remove(&id)?;
        let mut buf = BytesMut::new();
        for i in 0..partial.total {
            let chunk = partial.fragments.get(&i)?;
            buf.put_slice(chunk);
        }
        let mut reassembled = partial.template;
        reassembled.split = None;
        reassembled.order_channel = partial.channel;
        reassembled.payload = buf.freeze();
        Some(reassembled)
    }

    pub fn pending_splits(&self) -> usize {
        self.partials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Reliability;

    fn fragment(id: u16, index: u32, count: u32, payload: &'static [u8]) -> EncapsulatedMessage {
        EncapsulatedMessage {
            reliability: Reliability::Reliable,
            message_index: Some(crate::packet::Seq24(index)),
            order_index: None,
            order_channel: 0,
            split: Some(SplitInfo { count, id, index }),
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn reassembles_once_all_fragments_present() {
        let mut table = SplitTable::new();
        assert!(table.accept(fragment(1, 0, 3, b"foo")).is_none());
        assert!(table.accept(fragment(1, 2, 3, b"baz")).is_none());
        let done = table.accept(fragment(1, 1, 3, b"bar")).unwrap();
        assert_eq!(done.payload.as_ref(), b"foobarbaz");
        assert!(done.split.is_none());
        assert_eq!(table.pending_splits(), 0);
    }

    #[test]
    fn independent_split_ids_do_not_interfere() {
        let mut table = SplitTable::new();
        table.accept(fragment(1, 0, 2, b"a"));
        table.accept(fragment(2, 0, 2, b"x"));
        assert_eq!(table.pending_splits(), 2);
        let first = table.accept(fragment(1, 1, 2, b"b")).unwrap();
        assert_eq!(first.payload.as_ref(), b"ab");
        assert_eq!(table.pending_splits(), 1);
    }
}
