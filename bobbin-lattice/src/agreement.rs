//! The agreement actor: wires the pure core to the broadcast layer.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use bobbin_broadcast::BestEffortBroadcast;
use bobbin_core::frame::{ProposalFrame, TransportFrame};
use bobbin_core::host::HostId;

use crate::core::{Effect, LatticeCore};
use crate::round_buffer::RoundBuffer;

const CHANNEL_DEPTH: usize = 1024;

/// In-flight round window. A proposal for round r waits until all but the
/// last `SEND_WINDOW` earlier rounds have decided, bounding the per-round
/// state kept on every process.
pub const SEND_WINDOW: usize = 200;

/// One in-order decision, `values ⊇` the local proposal for `round`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub round: u64,
    pub values: BTreeSet<i32>,
}

/// Handle to the running agreement actor.
///
/// Decisions arrive on the channel returned by [`spawn`] with strictly
/// increasing rounds, starting at 0, with no gaps.
///
/// [`spawn`]: LatticeAgreement::spawn
#[derive(Clone)]
pub struct LatticeAgreement {
    proposals: mpsc::Sender<(u64, BTreeSet<i32>)>,
    window: Arc<Semaphore>,
}

impl LatticeAgreement {
    /// Spawn the agreement actor over a best-effort layer and the perfect
    /// link's delivery channel.
    #[must_use]
    pub fn spawn(
        beb: BestEffortBroadcast,
        deliveries: mpsc::Receiver<TransportFrame>,
        local: HostId,
        cancel: &CancellationToken,
    ) -> (Self, mpsc::Receiver<Decision>) {
        let (proposal_tx, proposal_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (decision_tx, decision_rx) = mpsc::channel(CHANNEL_DEPTH);
        let window = Arc::new(Semaphore::new(SEND_WINDOW));
        let core = LatticeCore::new(beb.hosts().majority());

        tokio::spawn(run_agreement(
            core,
            beb,
            local,
            proposal_rx,
            deliveries,
            decision_tx,
            Arc::clone(&window),
            cancel.clone(),
        ));

        (
            Self {
                proposals: proposal_tx,
                window,
            },
            decision_rx,
        )
    }

    /// Propose a value set for a round.
    ///
    /// Rounds must be proposed in increasing order. Suspends while the
    /// round is more than [`SEND_WINDOW`] ahead of the oldest undecided
    /// round; returns without broadcasting once the actor has shut down.
    pub async fn propose(&self, round: u64, values: BTreeSet<i32>) {
        let Ok(permit) = self.window.acquire().await else {
            trace!(round, "agreement actor is shut down, dropping proposal");
            return;
        };
        // Reclaimed by the actor when a round is released in order.
        permit.forget();
        if self.proposals.send((round, values)).await.is_err() {
            trace!(round, "agreement actor is shut down, dropping proposal");
        }
    }
}

#[expect(clippy::too_many_arguments, reason = "internal task entry point")]
#[instrument(skip_all, name = "lattice", fields(node = %local))]
async fn run_agreement(
    mut core: LatticeCore,
    beb: BestEffortBroadcast,
    local: HostId,
    mut proposals: mpsc::Receiver<(u64, BTreeSet<i32>)>,
    mut deliveries: mpsc::Receiver<TransportFrame>,
    decisions: mpsc::Sender<Decision>,
    window: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let mut buffer = RoundBuffer::new();

    debug!("agreement actor started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            proposal = proposals.recv() => {
                let Some((round, values)) = proposal else { break };
                trace!(round, count = values.len(), "proposing");
                let frame = core.propose(round, values);
                beb.broadcast(frame.encode()).await;
            }
            transport = deliveries.recv() => {
                let Some(transport) = transport else { break };
                let frame = match ProposalFrame::decode(transport.payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(peer = %transport.sender, error = %e, "dropping malformed proposal payload");
                        continue;
                    }
                };
                let effect = core.on_frame(transport.sender, frame);
                if !apply(effect, &beb, &decisions, &mut buffer, &window).await {
                    break;
                }
            }
        }
    }
    // Unblock any proposer still waiting on the window.
    window.close();
    debug!(next_round = buffer.next_round(), "agreement actor stopped");
}

/// Apply one core effect; returns false when the decision channel closed.
async fn apply(
    effect: Option<Effect>,
    beb: &BestEffortBroadcast,
    decisions: &mpsc::Sender<Decision>,
    buffer: &mut RoundBuffer,
    window: &Semaphore,
) -> bool {
    match effect {
        None => true,
        Some(Effect::Reply { to, frame }) => {
            beb.send(frame.encode(), to).await;
            true
        }
        Some(Effect::Broadcast(frame)) => {
            trace!(round = frame.round, pnum = frame.pnum, "re-proposing");
            beb.broadcast(frame.encode()).await;
            true
        }
        Some(Effect::Decide { round, values }) => {
            trace!(round, "round decided");
            for (round, values) in buffer.insert(round, values) {
                window.add_permits(1);
                if decisions.send(Decision { round, values }).await.is_err() {
                    debug!("decision channel closed, stopping agreement actor");
                    return false;
                }
            }
            true
        }
    }
}
