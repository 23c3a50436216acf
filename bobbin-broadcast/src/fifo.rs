//! FIFO ordering on top of uniform reliable broadcast.
//!
//! [`ReorderBuffer`] holds out-of-order instances in a per-source min-heap
//! keyed by `bseq` and releases the contiguous prefix; [`FifoBroadcast`]
//! stacks it on the uniform layer.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use bobbin_core::frame::{BroadcastFrame, TransportFrame};
use bobbin_core::host::HostId;

use crate::beb::BestEffortBroadcast;
use crate::urb::UniformReliableBroadcast;

const CHANNEL_DEPTH: usize = 1024;

/// Heap entry ordered by `bseq` alone.
struct ByBseq(BroadcastFrame);

impl PartialEq for ByBseq {
    fn eq(&self, other: &Self) -> bool {
        self.0.bseq == other.0.bseq
    }
}

impl Eq for ByBseq {}

impl PartialOrd for ByBseq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByBseq {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.bseq.cmp(&other.0.bseq)
    }
}

/// Per-source re-sequencing buffer.
///
/// `next_expected` starts at 1 for every source, matching the broadcast
/// layer's first assigned `bseq`. The uniform layer below guarantees
/// at-most-once per instance, so the heap never holds duplicates.
#[derive(Default)]
pub struct ReorderBuffer {
    heaps: HashMap<HostId, BinaryHeap<Reverse<ByBseq>>>,
    next_expected: HashMap<HostId, u64>,
}

impl ReorderBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer one delivery and release the now-contiguous prefix for its
    /// source, in `bseq` order.
    pub fn push(&mut self, frame: BroadcastFrame) -> Vec<BroadcastFrame> {
        let source = frame.source;
        let heap = self.heaps.entry(source).or_default();
        heap.push(Reverse(ByBseq(frame)));
        let next = self.next_expected.entry(source).or_insert(1);

        let mut released = Vec::new();
        while heap.peek().is_some_and(|Reverse(entry)| entry.0.bseq == *next) {
            let Some(Reverse(entry)) = heap.pop() else {
                break;
            };
            released.push(entry.0);
            *next += 1;
        }
        released
    }
}

/// FIFO uniform reliable broadcast.
///
/// Deliveries carry the guarantees of the uniform layer plus per-source
/// `bseq` order: an instance is only handed up after every lower `bseq`
/// from the same source.
#[derive(Clone)]
pub struct FifoBroadcast {
    urb: UniformReliableBroadcast,
}

impl FifoBroadcast {
    /// Spawn the uniform broadcast actor plus the re-sequencing stage.
    #[must_use]
    pub fn spawn(
        beb: BestEffortBroadcast,
        deliveries: mpsc::Receiver<TransportFrame>,
        local: HostId,
        cancel: &CancellationToken,
    ) -> (Self, mpsc::Receiver<BroadcastFrame>) {
        let (urb, urb_rx) = UniformReliableBroadcast::spawn(beb, deliveries, local, cancel);
        let (deliver_tx, deliver_rx) = mpsc::channel(CHANNEL_DEPTH);

        tokio::spawn(run_reorder(local, urb_rx, deliver_tx, cancel.clone()));

        (Self { urb }, deliver_rx)
    }

    /// Broadcast an application payload; see
    /// [`UniformReliableBroadcast::broadcast`].
    pub async fn broadcast(&self, inner: Bytes) {
        self.urb.broadcast(inner).await;
    }
}

#[instrument(skip_all, name = "fifo", fields(node = %local))]
async fn run_reorder(
    local: HostId,
    mut deliveries: mpsc::Receiver<BroadcastFrame>,
    deliver: mpsc::Sender<BroadcastFrame>,
    cancel: CancellationToken,
) {
    let mut buffer = ReorderBuffer::new();

    debug!("reorder stage started");
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = deliveries.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        for ready in buffer.push(frame) {
            trace!(source = %ready.source, bseq = ready.bseq, "releasing in order");
            if deliver.send(ready).await.is_err() {
                debug!("delivery channel closed, stopping reorder stage");
                return;
            }
        }
    }
    debug!("reorder stage stopped");
}
