//! Fixed-layout little-endian wire codec.
//!
//! Layout, all integers little-endian, no padding:
//!
//! ```text
//! transport datagram      broadcast payload      proposal payload
//! u8  tag = 0             u8  tag = 1            u8  tag = 2
//! u8  kind (0/1)          u16 source id          u8  kind (0/1/2)
//! u16 sender id           u64 bseq               u64 round
//! u16 receiver id         u32 inner length       u32 pnum
//! u64 seq                 [inner]                u32 value count
//! u32 payload length                             [i32 x count]
//! [payload]
//! ```
//!
//! A text payload (perfect-link milestone) is `u8 tag = 3` followed by raw
//! UTF-8. Decoders reject frames whose declared lengths exceed the received
//! buffer; encode/decode/encode is byte-identical (value sets are ordered).

use std::collections::BTreeSet;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::frame::{BroadcastFrame, FrameKind, ProposalFrame, ProposalKind, TransportFrame};
use crate::host::HostId;

/// Outermost tag of a transport datagram.
pub const TAG_TRANSPORT: u8 = 0;
/// Payload tag of a broadcast frame.
pub const TAG_BROADCAST: u8 = 1;
/// Payload tag of a proposal frame.
pub const TAG_PROPOSAL: u8 = 2;
/// Payload tag of a raw text message.
pub const TAG_TEXT: u8 = 3;

/// Largest datagram the fair-loss link will carry (UDP over IPv4).
pub const MAX_DATAGRAM: usize = 65507;

const TRANSPORT_HEADER: usize = 1 + 1 + 2 + 2 + 8 + 4;

/// A frame that failed structural validation. Such frames are dropped by
/// the receive loop without interrupting it.
#[derive(Debug, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than the declared or minimum layout requires.
    Truncated,
    /// Unknown outer or payload tag.
    UnknownTag(u8),
    /// Unknown frame or proposal kind byte.
    UnknownKind(u8),
    /// Text payload is not valid UTF-8.
    InvalidText,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated => f.write_str("frame truncated"),
            WireError::UnknownTag(t) => write!(f, "unknown frame tag {t}"),
            WireError::UnknownKind(k) => write!(f, "unknown frame kind {k}"),
            WireError::InvalidText => f.write_str("text payload is not valid UTF-8"),
        }
    }
}

impl std::error::Error for WireError {}

fn take_u8(buf: &mut Bytes) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut Bytes) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u16_le())
}

fn take_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u32_le())
}

fn take_u64(buf: &mut Bytes) -> Result<u64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u64_le())
}

fn take_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes, WireError> {
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    Ok(buf.copy_to_bytes(len))
}

impl TransportFrame {
    /// Serialized length of this frame on the wire.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        TRANSPORT_HEADER + self.payload.len()
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(TAG_TRANSPORT);
        buf.put_u8(self.kind as u8);
        buf.put_u16_le(self.sender.0);
        buf.put_u16_le(self.receiver.0);
        buf.put_u64_le(self.seq);
        buf.put_u32_le(u32::try_from(self.payload.len()).unwrap_or(u32::MAX));
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse one datagram.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] if the tag or kind byte is unknown or the
    /// declared payload length exceeds the buffer.
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let tag = take_u8(&mut buf)?;
        if tag != TAG_TRANSPORT {
            return Err(WireError::UnknownTag(tag));
        }
        let kind = match take_u8(&mut buf)? {
            0 => FrameKind::Data,
            1 => FrameKind::Ack,
            k => return Err(WireError::UnknownKind(k)),
        };
        let sender = HostId(take_u16(&mut buf)?);
        let receiver = HostId(take_u16(&mut buf)?);
        let seq = take_u64(&mut buf)?;
        let len = take_u32(&mut buf)? as usize;
        let payload = take_bytes(&mut buf, len)?;
        Ok(Self {
            kind,
            sender,
            receiver,
            seq,
            payload,
        })
    }
}

impl BroadcastFrame {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 2 + 8 + 4 + self.inner.len());
        buf.put_u8(TAG_BROADCAST);
        buf.put_u16_le(self.source.0);
        buf.put_u64_le(self.bseq);
        buf.put_u32_le(u32::try_from(self.inner.len()).unwrap_or(u32::MAX));
        buf.put_slice(&self.inner);
        buf.freeze()
    }

    /// Parse a broadcast payload.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] on an unexpected tag or a declared inner
    /// length exceeding the buffer.
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let tag = take_u8(&mut buf)?;
        if tag != TAG_BROADCAST {
            return Err(WireError::UnknownTag(tag));
        }
        let source = HostId(take_u16(&mut buf)?);
        let bseq = take_u64(&mut buf)?;
        let len = take_u32(&mut buf)? as usize;
        let inner = take_bytes(&mut buf, len)?;
        Ok(Self {
            source,
            bseq,
            inner,
        })
    }
}

impl ProposalFrame {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 1 + 8 + 4 + 4 + 4 * self.values.len());
        buf.put_u8(TAG_PROPOSAL);
        buf.put_u8(self.kind as u8);
        buf.put_u64_le(self.round);
        buf.put_u32_le(self.pnum);
        buf.put_u32_le(u32::try_from(self.values.len()).unwrap_or(u32::MAX));
        for v in &self.values {
            buf.put_i32_le(*v);
        }
        buf.freeze()
    }

    /// Parse a proposal payload.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] on an unexpected tag, unknown proposal kind,
    /// or a declared value count exceeding the buffer.
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let tag = take_u8(&mut buf)?;
        if tag != TAG_PROPOSAL {
            return Err(WireError::UnknownTag(tag));
        }
        let kind = match take_u8(&mut buf)? {
            0 => ProposalKind::Propose,
            1 => ProposalKind::Ack,
            2 => ProposalKind::Nack,
            k => return Err(WireError::UnknownKind(k)),
        };
        let round = take_u64(&mut buf)?;
        let pnum = take_u32(&mut buf)?;
        let count = take_u32(&mut buf)? as usize;
        if buf.remaining() < count.saturating_mul(4) {
            return Err(WireError::Truncated);
        }
        let mut values = BTreeSet::new();
        for _ in 0..count {
            values.insert(buf.get_i32_le());
        }
        Ok(Self {
            kind,
            round,
            pnum,
            values,
        })
    }
}

/// Encode a text payload for the perfect-link milestone.
#[must_use]
pub fn encode_text(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + text.len());
    buf.put_u8(TAG_TEXT);
    buf.put_slice(text.as_bytes());
    buf.freeze()
}

/// Decode a text payload.
///
/// # Errors
///
/// Returns a [`WireError`] on a missing tag or non-UTF-8 content.
pub fn decode_text(mut buf: Bytes) -> Result<String, WireError> {
    let tag = take_u8(&mut buf)?;
    if tag != TAG_TEXT {
        return Err(WireError::UnknownTag(tag));
    }
    String::from_utf8(buf.to_vec()).map_err(|_| WireError::InvalidText)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> TransportFrame {
        TransportFrame::data(HostId(1), HostId(2), 7, Bytes::from_static(b"payload"))
    }

    #[test]
    fn transport_roundtrip_is_byte_identical() {
        let frame = sample_data();
        let wire = frame.encode();
        let decoded = TransportFrame::decode(wire.clone()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.encode(), wire);
    }

    #[test]
    fn ack_swaps_endpoints_and_keeps_seq() {
        let data = sample_data();
        let ack = TransportFrame::ack_for(&data);
        assert_eq!(ack.sender, data.receiver);
        assert_eq!(ack.receiver, data.sender);
        assert_eq!(ack.seq, data.seq);
        assert!(ack.payload.is_empty());

        let decoded = TransportFrame::decode(ack.encode()).unwrap();
        assert_eq!(decoded, ack);
    }

    #[test]
    fn rejects_declared_length_past_buffer() {
        let mut wire = BytesMut::from(&sample_data().encode()[..]);
        // Inflate the declared payload length without adding bytes.
        wire[14..18].copy_from_slice(&1000u32.to_le_bytes());
        assert_eq!(
            TransportFrame::decode(wire.freeze()),
            Err(WireError::Truncated)
        );
    }

    #[test]
    fn rejects_unknown_outer_tag() {
        let mut wire = BytesMut::from(&sample_data().encode()[..]);
        wire[0] = 9;
        assert_eq!(
            TransportFrame::decode(wire.freeze()),
            Err(WireError::UnknownTag(9))
        );
    }

    #[test]
    fn rejects_unknown_frame_kind() {
        let mut wire = BytesMut::from(&sample_data().encode()[..]);
        wire[1] = 7;
        assert_eq!(
            TransportFrame::decode(wire.freeze()),
            Err(WireError::UnknownKind(7))
        );
    }

    #[test]
    fn rejects_empty_buffer() {
        assert_eq!(
            TransportFrame::decode(Bytes::new()),
            Err(WireError::Truncated)
        );
    }

    #[test]
    fn broadcast_roundtrip_preserves_instance() {
        let frame = BroadcastFrame::new(HostId(3), 41, Bytes::from_static(b"inner"));
        let decoded = BroadcastFrame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.instance(), (HostId(3), 41));
        assert_eq!(decoded, frame);
    }

    #[test]
    fn proposal_roundtrip_is_byte_identical() {
        let frame = ProposalFrame::propose(2, 3, [5, -1, 9].into_iter().collect());
        let wire = frame.encode();
        let decoded = ProposalFrame::decode(wire.clone()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.encode(), wire);
    }

    #[test]
    fn empty_value_set_is_legal() {
        let frame = ProposalFrame::ack(0, 1);
        let decoded = ProposalFrame::decode(frame.encode()).unwrap();
        assert!(decoded.values.is_empty());
    }

    #[test]
    fn rejects_value_count_past_buffer() {
        let mut wire = BytesMut::from(&ProposalFrame::ack(0, 1).encode()[..]);
        let count_at = wire.len() - 4;
        wire[count_at..].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(
            ProposalFrame::decode(wire.freeze()),
            Err(WireError::Truncated)
        );
    }

    #[test]
    fn text_roundtrip() {
        let wire = encode_text("42");
        assert_eq!(decode_text(wire).unwrap(), "42");
    }

    #[test]
    fn nested_broadcast_of_text_roundtrips() {
        let bf = BroadcastFrame::new(HostId(1), 1, encode_text("8"));
        let tf = TransportFrame::data(HostId(1), HostId(2), 0, bf.encode());
        let tf2 = TransportFrame::decode(tf.encode()).unwrap();
        let bf2 = BroadcastFrame::decode(tf2.payload).unwrap();
        assert_eq!(decode_text(bf2.inner).unwrap(), "8");
    }
}
