//! Uniform reliable broadcast via the majority-ack algorithm.
//!
//! The state transitions live in [`UrbCore`], a pure struct with no I/O,
//! so the delivery rule can be tested directly; [`UniformReliableBroadcast`]
//! is the actor that owns a core and wires it to the best-effort layer.
//!
//! Sketch: the first time an instance is seen it is relayed verbatim, so
//! by best-effort validity every correct process eventually relays it;
//! once a majority of relayers has been observed the instance is delivered.
//! A majority of relayers means at least one correct process relays, which
//! carries the instance to everyone else — uniform agreement.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use bobbin_core::frame::{BroadcastFrame, TransportFrame};
use bobbin_core::host::HostId;

use crate::beb::BestEffortBroadcast;

const CHANNEL_DEPTH: usize = 1024;

/// Reaction to one best-effort delivery: relay the instance (first
/// sighting) and/or deliver it upward (majority reached).
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UrbStep {
    pub relay: Option<BroadcastFrame>,
    pub deliver: Option<BroadcastFrame>,
}

/// Pure majority-ack state machine.
///
/// `pending` holds instances relayed at least once, `acks` the relayers
/// observed per instance, `delivered` the instances already handed up.
/// Entries are never removed from `pending` or `delivered`; they identify
/// duplicates for the rest of the run.
pub struct UrbCore {
    local: HostId,
    majority: usize,
    next_bseq: u64,
    pending: HashSet<(HostId, u64)>,
    acks: HashMap<(HostId, u64), HashSet<HostId>>,
    delivered: HashSet<(HostId, u64)>,
}

impl UrbCore {
    #[must_use]
    pub fn new(local: HostId, majority: usize) -> Self {
        Self {
            local,
            majority,
            next_bseq: 1,
            pending: HashSet::new(),
            acks: HashMap::new(),
            delivered: HashSet::new(),
        }
    }

    /// Wrap a payload in the next broadcast instance of this process and
    /// mark it pending. The caller broadcasts the returned frame.
    pub fn broadcast(&mut self, inner: Bytes) -> BroadcastFrame {
        let frame = BroadcastFrame::new(self.local, self.next_bseq, inner);
        self.next_bseq += 1;
        self.pending.insert(frame.instance());
        frame
    }

    /// Handle one best-effort delivery of `frame` relayed by `relayer`.
    pub fn on_relay(&mut self, relayer: HostId, frame: &BroadcastFrame) -> UrbStep {
        let instance = frame.instance();
        let mut step = UrbStep::default();

        let acks = self.acks.entry(instance).or_default();
        acks.insert(relayer);
        let ack_count = acks.len();

        if self.pending.insert(instance) {
            // First sighting: relay verbatim, source and bseq preserved.
            step.relay = Some(frame.clone());
        }

        if ack_count >= self.majority && !self.delivered.contains(&instance) {
            self.delivered.insert(instance);
            self.acks.remove(&instance);
            step.deliver = Some(frame.clone());
        }
        step
    }
}

/// Handle to the running broadcast actor.
///
/// Deliveries arrive on the channel returned by [`spawn`], at most once
/// per `(source, bseq)`, once a majority of the fleet has relayed the
/// instance.
///
/// [`spawn`]: UniformReliableBroadcast::spawn
#[derive(Clone)]
pub struct UniformReliableBroadcast {
    payloads: mpsc::Sender<Bytes>,
}

impl UniformReliableBroadcast {
    /// Spawn the broadcast actor over a best-effort layer and the perfect
    /// link's delivery channel.
    #[must_use]
    pub fn spawn(
        beb: BestEffortBroadcast,
        deliveries: mpsc::Receiver<TransportFrame>,
        local: HostId,
        cancel: &CancellationToken,
    ) -> (Self, mpsc::Receiver<BroadcastFrame>) {
        let (payload_tx, payload_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (deliver_tx, deliver_rx) = mpsc::channel(CHANNEL_DEPTH);
        let core = UrbCore::new(local, beb.hosts().majority());

        tokio::spawn(run_urb(
            core,
            beb,
            payload_rx,
            deliveries,
            deliver_tx,
            cancel.clone(),
        ));

        (
            Self {
                payloads: payload_tx,
            },
            deliver_rx,
        )
    }

    /// Broadcast an application payload to the fleet. Suspends while the
    /// actor's queue is full; after shutdown the payload is dropped.
    pub async fn broadcast(&self, inner: Bytes) {
        if self.payloads.send(inner).await.is_err() {
            trace!("broadcast actor is shut down, dropping payload");
        }
    }
}

#[instrument(skip_all, name = "urb", fields(node = %core.local))]
async fn run_urb(
    mut core: UrbCore,
    beb: BestEffortBroadcast,
    mut payloads: mpsc::Receiver<Bytes>,
    mut deliveries: mpsc::Receiver<TransportFrame>,
    deliver: mpsc::Sender<BroadcastFrame>,
    cancel: CancellationToken,
) {
    debug!(majority = core.majority, "broadcast actor started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            payload = payloads.recv() => {
                let Some(payload) = payload else { break };
                let frame = core.broadcast(payload);
                trace!(source = %frame.source, bseq = frame.bseq, "broadcasting");
                beb.broadcast(frame.encode()).await;
            }
            transport = deliveries.recv() => {
                let Some(transport) = transport else { break };
                let frame = match BroadcastFrame::decode(transport.payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(relayer = %transport.sender, error = %e, "dropping malformed broadcast payload");
                        continue;
                    }
                };
                let step = core.on_relay(transport.sender, &frame);
                if let Some(relay) = step.relay {
                    trace!(source = %relay.source, bseq = relay.bseq, "relaying");
                    beb.broadcast(relay.encode()).await;
                }
                if let Some(frame) = step.deliver {
                    trace!(source = %frame.source, bseq = frame.bseq, "delivering");
                    if deliver.send(frame).await.is_err() {
                        debug!("delivery channel closed, stopping broadcast actor");
                        break;
                    }
                }
            }
        }
    }
    debug!("broadcast actor stopped");
}
