//! Frame types carried by the stack.
//!
//! A datagram on the wire is always a [`TransportFrame`]. Its payload is
//! opaque to the link layer; the broadcast layers re-parse it as a
//! [`BroadcastFrame`] and the agreement layer as a [`ProposalFrame`].

use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;

use crate::host::HostId;

/// Link-layer frame kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Data = 0,
    Ack = 1,
}

/// The point-to-point frame exchanged by the perfect link.
///
/// `seq` is a per-sender counter assigned when the frame is enqueued. An
/// ACK carries the `seq` of the DATA it acknowledges, with `sender` and
/// `receiver` swapped, and an empty payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportFrame {
    pub kind: FrameKind,
    pub sender: HostId,
    pub receiver: HostId,
    pub seq: u64,
    pub payload: Bytes,
}

impl TransportFrame {
    #[must_use]
    pub fn data(sender: HostId, receiver: HostId, seq: u64, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Data,
            sender,
            receiver,
            seq,
            payload,
        }
    }

    /// The acknowledgement for a DATA frame: same seq, endpoints swapped.
    #[must_use]
    pub fn ack_for(data: &TransportFrame) -> Self {
        Self {
            kind: FrameKind::Ack,
            sender: data.receiver,
            receiver: data.sender,
            seq: data.seq,
            payload: Bytes::new(),
        }
    }

    #[must_use]
    pub fn is_data(&self) -> bool {
        self.kind == FrameKind::Data
    }
}

impl fmt::Display for TransportFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FrameKind::Data => write!(
                f,
                "DATA {}->{} seq={} len={}",
                self.sender,
                self.receiver,
                self.seq,
                self.payload.len()
            ),
            FrameKind::Ack => {
                write!(f, "ACK {}->{} seq={}", self.sender, self.receiver, self.seq)
            }
        }
    }
}

/// A broadcast instance, uniquely identified by `(source, bseq)`.
///
/// Relayers must preserve both fields byte-for-byte; `source` names the
/// original broadcaster, not the relaying peer. `bseq` counts per source
/// starting at 1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastFrame {
    pub source: HostId,
    pub bseq: u64,
    pub inner: Bytes,
}

impl BroadcastFrame {
    #[must_use]
    pub fn new(source: HostId, bseq: u64, inner: Bytes) -> Self {
        Self {
            source,
            bseq,
            inner,
        }
    }

    /// The identity of this broadcast instance.
    #[must_use]
    pub fn instance(&self) -> (HostId, u64) {
        (self.source, self.bseq)
    }
}

/// Proposal message kind within an agreement round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ProposalKind {
    Propose = 0,
    Ack = 1,
    Nack = 2,
}

/// One lattice-agreement message.
///
/// `pnum` distinguishes successive proposals by the same proposer within a
/// round; stale ACK/NACK replies are discarded by comparing it. ACKs carry
/// no values, NACKs carry the replier's full accepted set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposalFrame {
    pub kind: ProposalKind,
    pub round: u64,
    pub pnum: u32,
    pub values: BTreeSet<i32>,
}

impl ProposalFrame {
    #[must_use]
    pub fn propose(round: u64, pnum: u32, values: BTreeSet<i32>) -> Self {
        Self {
            kind: ProposalKind::Propose,
            round,
            pnum,
            values,
        }
    }

    #[must_use]
    pub fn ack(round: u64, pnum: u32) -> Self {
        Self {
            kind: ProposalKind::Ack,
            round,
            pnum,
            values: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn nack(round: u64, pnum: u32, values: BTreeSet<i32>) -> Self {
        Self {
            kind: ProposalKind::Nack,
            round,
            pnum,
            values,
        }
    }
}
