//! Connected-phase wire shapes: custom datagrams, the encapsulated messages
//! they carry, and ACK/NACK range records.
//!
//! The flags byte and split header layout follow
//! `CoolLoong-raknet-rs::packet::connected::{Flags, Fragment}`; the ACK/NACK
//! range packing is a direct port of that crate's `Ack::extend_from`,
//! adapted to this crate's [`Seq24`] in place of its `Uint24le`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Seq24;
use crate::errors::CodecError;

/// The eight reliability classes RakNet messages can be sent with.
///
/// Bit layout on the wire (top 3 bits of the flags byte), matching
/// `sauoro-amethyst::raknet::protocol::reliability::Reliability`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Reliability {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
    UnreliableWithAckReceipt = 5,
    ReliableWithAckReceipt = 6,
    ReliableOrderedWithAckReceipt = 7,
}

impl Reliability {
    pub fn from_id(id: u8) -> Result<Self, CodecError> {
        Ok(match id {
            0 => Reliability::Unreliable,
            1 => Reliability::UnreliableSequenced,
            2 => Reliability::Reliable,
            3 => Reliability::ReliableOrdered,
            4 => Reliability::ReliableSequenced,
            5 => Reliability::UnreliableWithAckReceipt,
            6 => Reliability::ReliableWithAckReceipt,
            7 => Reliability::ReliableOrderedWithAckReceipt,
            other => return Err(CodecError::InvalidReliability(other)),
        })
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Reliability::Reliable
                | Reliability::ReliableOrdered
                | Reliability::ReliableSequenced
                | Reliability::ReliableWithAckReceipt
                | Reliability::ReliableOrderedWithAckReceipt
        )
    }

    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            Reliability::ReliableOrdered | Reliability::ReliableOrderedWithAckReceipt
        )
    }

    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            Reliability::UnreliableSequenced | Reliability::ReliableSequenced
        )
    }

    pub fn has_ordering_channel(self) -> bool {
        self.is_ordered() || self.is_sequenced()
    }

    pub fn requests_ack_receipt(self) -> bool {
        matches!(
            self,
            Reliability::UnreliableWithAckReceipt
                | Reliability::ReliableWithAckReceipt
                | Reliability::ReliableOrderedWithAckReceipt
        )
    }
}

const FLAG_SPLIT: u8 = 0x10;

/// Split header carried by a message fragment: total fragment count, a
/// split id shared by all fragments of one message, and this fragment's
/// index. All three fields are big-endian on the wire (spec.md §9 Open
/// Question, resolved against `Jyuggers-tokio-raknet` and
/// `gzachrisson-bedroxide`'s split_packet_handler framing).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SplitInfo {
    pub count: u32,
    pub id: u16,
    pub index: u32,
}

/// One message encapsulated inside a [`CustomPacket`] datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapsulatedMessage {
    pub reliability: Reliability,
    /// Present for every reliable class; assigned by the sender's resend
    /// tracker and echoed back in ACK/NACK records.
    pub message_index: Option<Seq24>,
    /// Present for ordered and sequenced classes.
    pub order_index: Option<Seq24>,
    pub order_channel: u8,
    pub split: Option<SplitInfo>,
    pub payload: Bytes,
}

impl EncapsulatedMessage {
    pub fn read(buf: &mut BytesMut) -> Result<Self, CodecError> {
        if buf.remaining() < 1 {
            return Err(CodecError::Truncated { offset: buf.len() });
        }
        let flags = buf.get_u8();
        let reliability = Reliability::from_id((flags >> 5) & 0x07)?;
        let has_split = flags & FLAG_SPLIT != 0;

        if buf.remaining() < 2 {
            return Err(CodecError::Truncated { offset: buf.len() });
        }
        let bit_length = buf.get_u16();
        let byte_length = (bit_length as usize + 7) / 8;

        let message_index = if reliability.is_reliable() {
            Some(Seq24::read(buf)?)
        } else {
            None
        };

        let (order_index, order_channel) = if reliability.has_ordering_channel() {
            let idx = Seq24::read(buf)?;
            if buf.remaining() < 1 {
                return Err(CodecError::Truncated { offset: buf.len() });
            }
            (Some(idx), buf.get_u8())
        } else {
            (None, 0)
        };

        let split = if has_split {
            if buf.remaining() < 10 {
                return Err(CodecError::Truncated { offset: buf.len() });
            }
            Some(SplitInfo {
                count: buf.get_u32(),
                id: buf.get_u16(),
                index: buf.get_u32(),
            })
        } else {
            None
        };

        if buf.remaining() < byte_length {
            return Err(CodecError::Truncated { offset: buf.len() });
        }
        let payload = buf.split_to(byte_length).freeze();

        Ok(EncapsulatedMessage {
            reliability,
            message_index,
            order_index,
            order_channel,
            split,
            payload,
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        let mut flags = self.reliability.id() << 5;
        if self.split.is_some() {
            flags |= FLAG_SPLIT;
        }
        buf.put_u8(flags);
        buf.put_u16((self.payload.len() * 8) as u16);

        if let Some(idx) = self.message_index {
            idx.write(buf);
        }
        if let Some(idx) = self.order_index {
            idx.write(buf);
            buf.put_u8(self.order_channel);
        }
        if let Some(split) = self.split {
            buf.put_u32(split.count);
            buf.put_u16(split.id);
            buf.put_u32(split.index);
        }
        buf.put_slice(&self.payload);
    }

    /// Size this message occupies inside a datagram, for MTU budgeting.
    pub fn wire_size(&self) -> usize {
        let mut n = 1 + 2;
        if self.message_index.is_some() {
            n += 3;
        }
        if self.order_index.is_some() {
            n += 3 + 1;
        }
        if self.split.is_some() {
            n += 10;
        }
        n + self.payload.len()
    }
}

/// A custom datagram: a 24-bit sequence number followed by one or more
/// encapsulated messages packed back to back until the buffer is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomPacket {
    pub sequence: Seq24,
    pub messages: Vec<EncapsulatedMessage>,
}

impl CustomPacket {
    pub fn read(buf: &mut BytesMut) -> Result<Self, CodecError> {
        let sequence = Seq24::read(buf)?;
        let mut messages = Vec::new();
        while buf.has_remaining() {
            messages.push(EncapsulatedMessage::read(buf)?);
        }
        Ok(CustomPacket { sequence, messages })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        self.sequence.write(buf);
        for m in &self.messages {
            m.write(buf);
        }
    }
}

/// One ACK/NACK range record: either a single sequence number or an
/// inclusive `[start, end]` range, matching
/// `CoolLoong-raknet-rs::packet::connected::Record`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Record {
    Single(Seq24),
    Range(Seq24, Seq24),
}

const RECORD_RANGE: u8 = 0;
const RECORD_SINGLE: u8 = 1;

/// An ack/nack record is at least 7 bytes on the wire (1 kind byte + two
/// 3-byte sequence numbers); even a maximal jumbo-frame MTU can't carry more
/// than a few hundred of them, so a declared count past this is bogus.
const MAX_ACK_RECORDS: usize = 4096;

/// A set of ACK or NACK records. Encoding packs consecutive sequence
/// numbers into ranges, and [`Ack::extend_from`] additionally respects an
/// MTU byte budget, dropping any sequence numbers that don't fit so the
/// caller can retry them on the next flush instead of fragmenting the
/// ack datagram itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ack {
    pub records: Vec<Record>,
}

impl Ack {
    pub fn read(buf: &mut BytesMut) -> Result<Self, CodecError> {
        if buf.remaining() < 2 {
            return Err(CodecError::Truncated { offset: buf.len() });
        }
        let count = buf.get_u16() as usize;
        if count > MAX_ACK_RECORDS {
            return Err(CodecError::AckCountExceeded(count as u32));
        }
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 1 {
                return Err(CodecError::Truncated { offset: buf.len() });
            }
            let kind = buf.get_u8();
            match kind {
                RECORD_RANGE => {
                    let start = Seq24::read(buf)?;
                    let end = Seq24::read(buf)?;
                    records.push(Record::Range(start, end));
                }
                RECORD_SINGLE => {
                    let seq = Seq24::read(buf)?;
                    records.push(Record::Single(seq));
                }
                other => return Err(CodecError::InvalidRecordType(other)),
            }
        }
        Ok(Ack { records })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.records.len() as u16);
        for r in &self.records {
            match r {
                Record::Range(start, end) => {
                    buf.put_u8(RECORD_RANGE);
                    start.write(buf);
                    end.write(buf);
                }
                Record::Single(seq) => {
                    buf.put_u8(RECORD_SINGLE);
                    seq.write(buf);
                }
            }
        }
    }

    /// Builds an `Ack` from a sorted, deduplicated list of sequence
    /// numbers, coalescing consecutive runs into ranges and stopping once
    /// `budget_bytes` worth of records has been packed. Returns the index
    /// of the first sequence number that didn't fit (`seqs.len()` if all
    /// fit), so the caller can carry the remainder over to the next flush.
    pub fn extend_from(seqs: &[Seq24], budget_bytes: usize) -> (Self, usize) {
        const RANGE_SIZE: usize = 1 + 3 + 3;
        const SINGLE_SIZE: usize = 1 + 3;
        const HEADER_SIZE: usize = 2;

        let mut records = Vec::new();
        let mut used = HEADER_SIZE;
        let mut i = 0;
        while i < seqs.len() {
            let start = seqs[i];
            let mut end = start;
            let mut j = i + 1;
            while j < seqs.len() && seqs[j].0 == end.0 + 1 {
                end = seqs[j];
                j += 1;
            }
            let size = if end == start { SINGLE_SIZE } else { RANGE_SIZE };
            if used + size > budget_bytes {
                break;
            }
            used += size;
            if end == start {
                records.push(Record::Single(start));
            } else {
                records.push(Record::Range(start, end));
            }
            i = j;
        }
        (Ack { records }, i)
    }

    /// Expands all records back into an iterator of individual sequence
    /// numbers, in ascending order within each record.
    pub fn iter_sequences(&self) -> impl Iterator<Item = Seq24> + '_ {
        self.records.iter().flat_map(|r| match r {
            Record::Single(s) => SeqRangeIter {
                next: s.0,
                end: s.0,
                done: false,
            },
            Record::Range(start, end) => SeqRangeIter {
                next: start.0,
                end: end.0,
                done: false,
            },
        })
    }
}

struct SeqRangeIter {
    next: u32,
    end: u32,
    done: bool,
}

impl Iterator for SeqRangeIter {
    type Item = Seq24;
    fn next(&mut self) -> Option<Seq24> {
        if self.done {
            return None;
        }
        let cur = self.next;
        if cur == self.end {
            self.done = true;
        } else {
            self.next += 1;
        }
        Some(Seq24(cur))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seqs(vals: &[u32]) -> Vec<Seq24> {
        vals.iter().copied().map(Seq24).collect()
    }

    #[test]
    fn message_round_trips_reliable_ordered() {
        let msg = EncapsulatedMessage {
            reliability: Reliability::ReliableOrdered,
            message_index: Some(Seq24(5)),
            order_index: Some(Seq24(2)),
            order_channel: 0,
            split: None,
            payload: Bytes::from_static(b"hello"),
        };
        let mut buf = BytesMut::new();
        msg.write(&mut buf);
        let decoded = EncapsulatedMessage::read(&mut buf).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn message_round_trips_split_fragment() {
        let msg = EncapsulatedMessage {
            reliability: Reliability::Reliable,
            message_index: Some(Seq24(9)),
            order_index: None,
            order_channel: 0,
            split: Some(SplitInfo {
                count: 3,
                id: 7,
                index: 1,
            }),
            payload: Bytes::from_static(b"chunk"),
        };
        let mut buf = BytesMut::new();
        msg.write(&mut buf);
        let decoded = EncapsulatedMessage::read(&mut buf).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn custom_packet_round_trips_multiple_messages() {
        let packet = CustomPacket {
            sequence: Seq24(42),
            messages: vec![
                EncapsulatedMessage {
                    reliability: Reliability::Unreliable,
                    message_index: None,
                    order_index: None,
                    order_channel: 0,
                    split: None,
                    payload: Bytes::from_static(b"a"),
                },
                EncapsulatedMessage {
                    reliability: Reliability::Reliable,
                    message_index: Some(Seq24(1)),
                    order_index: None,
                    order_channel: 0,
                    split: None,
                    payload: Bytes::from_static(b"bb"),
                },
            ],
        };
        let mut buf = BytesMut::new();
        packet.write(&mut buf);
        let decoded = CustomPacket::read(&mut buf).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn ack_coalesces_consecutive_runs_into_ranges() {
        let s = seqs(&[1, 2, 3, 7, 8, 10]);
        let (ack, consumed) = Ack::extend_from(&s, 4096);
        assert_eq!(consumed, s.len());
        assert_eq!(
            ack.records,
            vec![
                Record::Range(Seq24(1), Seq24(3)),
                Record::Range(Seq24(7), Seq24(8)),
                Record::Single(Seq24(10)),
            ]
        );
    }

    #[test]
    fn ack_respects_mtu_budget_and_reports_remainder() {
        let s = seqs(&[1, 2, 3, 4, 5, 6]);
        // header(2) + one range(7) = 9 bytes exactly fits one coalesced run.
        let (ack, consumed) = Ack::extend_from(&s, 9);
        assert_eq!(ack.records, vec![Record::Range(Seq24(1), Seq24(6))]);
        assert_eq!(consumed, 6);

        // Too small for even one record: nothing packed, nothing consumed.
        let (ack_empty, consumed_empty) = Ack::extend_from(&s, 2);
        assert!(ack_empty.records.is_empty());
        assert_eq!(consumed_empty, 0);
    }

    #[test]
    fn ack_rejects_an_oversized_declared_record_count() {
        let mut buf = BytesMut::new();
        buf.put_u16((MAX_ACK_RECORDS + 1) as u16);
        let err = Ack::read(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::AckCountExceeded(_)));
    }

    #[test]
    fn ack_round_trips_through_wire() {
        let (ack, _) = Ack::extend_from(&seqs(&[1, 2, 3, 9]), 4096);
        let mut buf = BytesMut::new();
        ack.write(&mut buf);
        let decoded = Ack::read(&mut buf).unwrap();
        assert_eq!(decoded, ack);
    }

    #[test]
    fn iter_sequences_expands_ranges() {
        let ack = Ack {
            records: vec![Record::Range(Seq24(4), Seq24(6)), Record::Single(Seq24(9))],
        };
        let got: Vec<u32> = ack.iter_sequences().map(|s| s.0).collect();
        assert_eq!(got, vec![4, 5, 6, 9]);
    }
}
