//! Perfect link: exactly-once delivery per `(sender, seq)`.
//!
//! Built from stubborn retransmission and receive-side dedup. Two tasks
//! run per link: the sender pumps a work queue of outstanding DATA frames
//! in a round-robin cycle, dropping frames once their ACK has arrived; the
//! receiver ACKs every DATA frame it sees and forwards first-time
//! deliveries into a bounded channel in arrival order.
//!
//! A frame destined to a peer that has crashed forever simply stays in the
//! cycle; the link is defined over non-crashing recipients and shutdown
//! discards the queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use bobbin_core::codec::MAX_DATAGRAM;
use bobbin_core::frame::{FrameKind, TransportFrame};
use bobbin_core::host::{HostId, HostTable};

use crate::fair_loss::FairLossLink;

/// Depth of the retransmit feed and of the delivery channel. Producers
/// suspend when full, which is the only flow control across the stack.
const QUEUE_DEPTH: usize = 1024;

/// Pause between retransmission cycles. One cycle transmits every
/// outstanding frame once, so the round-robin period stays proportional to
/// the queue length as the queue grows.
const RETRANSMIT_PAUSE: Duration = Duration::from_millis(10);

/// Progress counters, reported at shutdown.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinkStats {
    /// DATA frames enqueued for first transmission.
    pub sent: u64,
    /// First-time deliveries forwarded upward.
    pub delivered: u64,
}

struct PeerState {
    next_seq: AtomicU64,
    acked: Mutex<HashSet<u64>>,
    delivered: Mutex<HashSet<u64>>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            next_seq: AtomicU64::new(0),
            acked: Mutex::new(HashSet::new()),
            delivered: Mutex::new(HashSet::new()),
        }
    }
}

/// Per-peer link state, striped by peer id so the sender and receiver
/// tasks contend only on the peer they are touching.
struct PeerBook {
    peers: HashMap<HostId, PeerState>,
    sent: AtomicU64,
    delivered: AtomicU64,
}

impl PeerBook {
    fn new(hosts: &HostTable) -> Self {
        Self {
            peers: hosts.ids().map(|id| (id, PeerState::new())).collect(),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    fn next_seq(&self, peer: HostId) -> Option<u64> {
        let state = self.peers.get(&peer)?;
        Some(state.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    fn is_acked(&self, peer: HostId, seq: u64) -> bool {
        self.peers.get(&peer).is_some_and(|state| {
            state
                .acked
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&seq)
        })
    }

    fn mark_acked(&self, peer: HostId, seq: u64) {
        if let Some(state) = self.peers.get(&peer) {
            state
                .acked
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(seq);
        }
    }

    /// Record a delivery; returns false for duplicates.
    fn mark_delivered(&self, peer: HostId, seq: u64) -> bool {
        let Some(state) = self.peers.get(&peer) else {
            return false;
        };
        state
            .delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(seq)
    }
}

/// Handle to a running perfect link.
///
/// Cloneable; every clone feeds the same sender task. Deliveries arrive on
/// the channel returned by [`PerfectLink::spawn`], at most once per
/// `(sender, seq)`, in arrival order of first receptions.
#[derive(Clone)]
pub struct PerfectLink {
    local: HostId,
    outgoing: mpsc::Sender<TransportFrame>,
    book: Arc<PeerBook>,
}

impl PerfectLink {
    /// Spawn the sender and receiver tasks over a bound fair-loss link.
    ///
    /// Cancelling the token stops both tasks; frames still queued are
    /// dropped.
    #[must_use]
    pub fn spawn(
        link: FairLossLink,
        local: HostId,
        hosts: &HostTable,
        cancel: &CancellationToken,
    ) -> (Self, mpsc::Receiver<TransportFrame>) {
        let link = Arc::new(link);
        let book = Arc::new(PeerBook::new(hosts));
        let (outgoing, queue_rx) = mpsc::channel(QUEUE_DEPTH);
        let (deliver_tx, deliver_rx) = mpsc::channel(QUEUE_DEPTH);

        tokio::spawn(run_sender(
            Arc::clone(&link),
            Arc::clone(&book),
            hosts.clone(),
            queue_rx,
            cancel.clone(),
        ));
        tokio::spawn(run_receiver(
            link,
            Arc::clone(&book),
            local,
            hosts.clone(),
            deliver_tx,
            cancel.clone(),
        ));

        (
            Self {
                local,
                outgoing,
                book,
            },
            deliver_rx,
        )
    }

    /// Enqueue a payload for reliable delivery to `dest`.
    ///
    /// Assigns the next per-destination sequence number and returns once
    /// the frame is queued; transmission and retransmission run
    /// asynchronously. Suspends while the queue is full. After shutdown
    /// the frame is silently dropped.
    pub async fn send(&self, payload: Bytes, dest: HostId) {
        debug_assert!(payload.len() + 64 < MAX_DATAGRAM);
        let Some(seq) = self.book.next_seq(dest) else {
            warn!(%dest, "send to unknown host, dropping");
            return;
        };
        self.book.sent.fetch_add(1, Ordering::Relaxed);
        let frame = TransportFrame::data(self.local, dest, seq, payload);
        if self.outgoing.send(frame).await.is_err() {
            trace!("link is shut down, dropping frame");
        }
    }

    /// Snapshot of the progress counters.
    #[must_use]
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            sent: self.book.sent.load(Ordering::Relaxed),
            delivered: self.book.delivered.load(Ordering::Relaxed),
        }
    }
}

/// Retransmission cycle: pop one frame, drop it if acked, otherwise
/// transmit and re-enqueue at the tail. New frames join the tail from the
/// feed channel, so a fresh frame waits at most one cycle plus one pause
/// for its first transmission.
#[instrument(skip_all, name = "pl-sender")]
async fn run_sender(
    link: Arc<FairLossLink>,
    book: Arc<PeerBook>,
    hosts: HostTable,
    mut feed: mpsc::Receiver<TransportFrame>,
    cancel: CancellationToken,
) {
    let mut cycle: VecDeque<TransportFrame> = VecDeque::new();
    let mut pass_left = 0usize;

    debug!("sender started");
    loop {
        while let Ok(frame) = feed.try_recv() {
            cycle.push_back(frame);
        }

        let Some(frame) = cycle.pop_front() else {
            pass_left = 0;
            tokio::select! {
                () = cancel.cancelled() => break,
                next = feed.recv() => match next {
                    Some(frame) => {
                        cycle.push_back(frame);
                        continue;
                    }
                    None => break,
                },
            }
        };
        if pass_left == 0 {
            pass_left = cycle.len() + 1;
        }
        pass_left -= 1;

        if book.is_acked(frame.receiver, frame.seq) {
            trace!(%frame, "acked, dropping from cycle");
        } else if let Some(addr) = hosts.addr_of(frame.receiver) {
            link.send(&frame, addr).await;
            cycle.push_back(frame);
        }

        if pass_left == 0 && !cycle.is_empty() {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(RETRANSMIT_PAUSE) => {}
            }
        }
    }
    debug!(outstanding = cycle.len(), "sender stopped");
}

/// Receive loop: ACK every DATA frame (duplicates included, so a lost ACK
/// is repaired by the peer's retransmission), deduplicate, and forward
/// first-time deliveries upward.
#[instrument(skip_all, name = "pl-receiver", fields(node = %local))]
async fn run_receiver(
    link: Arc<FairLossLink>,
    book: Arc<PeerBook>,
    local: HostId,
    hosts: HostTable,
    deliver: mpsc::Sender<TransportFrame>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    debug!("receiver started");
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            received = link.recv(&mut buf) => match received {
                Ok((frame, _from)) => frame,
                Err(e) => {
                    warn!(error = %e, "receive failed");
                    continue;
                }
            },
        };

        if frame.receiver != local || !hosts.contains(frame.sender) {
            trace!(%frame, "frame not addressed to us, dropping");
            continue;
        }

        match frame.kind {
            FrameKind::Data => {
                let ack = TransportFrame::ack_for(&frame);
                if let Some(addr) = hosts.addr_of(frame.sender) {
                    link.send(&ack, addr).await;
                }
                if book.mark_delivered(frame.sender, frame.seq) {
                    book.delivered.fetch_add(1, Ordering::Relaxed);
                    trace!(%frame, "delivering");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        sent = deliver.send(frame) => {
                            if sent.is_err() {
                                debug!("delivery channel closed, stopping receiver");
                                break;
                            }
                        }
                    }
                } else {
                    trace!(%frame, "duplicate, dropping");
                }
            }
            FrameKind::Ack => book.mark_acked(frame.sender, frame.seq),
        }
    }
    debug!("receiver stopped");
}
