//! Pure state machine for lattice agreement - no I/O, no async.
//!
//! Every process plays two roles per round. As an acceptor it maintains
//! `accepted`, the join of every proposal it has seen, ACKing proposals
//! that contain it and NACKing (with the full join) those that do not. As
//! a proposer it counts ACK/NACK replies to its current proposal number:
//! a quorum of replies containing at least one NACK triggers a re-proposal
//! of the enlarged set; a quorum of pure ACKs decides.
//!
//! Consistency sketch: any two quorums intersect, so of two decided sets
//! the later-accepted one passed through an acceptor that already held the
//! other - decisions are totally ordered by inclusion.

use std::collections::{BTreeSet, HashMap};

use bobbin_core::frame::{ProposalFrame, ProposalKind};
use bobbin_core::host::HostId;

/// What the runner must do after feeding one frame to the core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Reply to the peer that sent a PROPOSE.
    Reply { to: HostId, frame: ProposalFrame },
    /// Broadcast a re-proposal to the fleet.
    Broadcast(ProposalFrame),
    /// The round reached a decision.
    Decide { round: u64, values: BTreeSet<i32> },
}

#[derive(Debug, Default)]
struct RoundState {
    /// Still waiting for a decision in this round.
    active: bool,
    /// Our proposal, grown by the values carried in NACKs.
    proposal: BTreeSet<i32>,
    /// Proposal number of the proposal currently collecting replies.
    pnum: u32,
    ack_count: usize,
    nack_count: usize,
    /// Acceptor role: the join of every proposal seen for this round.
    accepted: BTreeSet<i32>,
}

/// Per-round lattice agreement state, lazily initialized.
pub struct LatticeCore {
    threshold: usize,
    rounds: HashMap<u64, RoundState>,
}

impl LatticeCore {
    /// `threshold` is the quorum size, fleet-wide: ⌊N/2⌋ + 1.
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            rounds: HashMap::new(),
        }
    }

    /// Start (or restart) this process's proposal for a round.
    ///
    /// Resets the reply counts, bumps the proposal number, and returns the
    /// PROPOSE frame to broadcast.
    pub fn propose(&mut self, round: u64, values: BTreeSet<i32>) -> ProposalFrame {
        let state = self.rounds.entry(round).or_default();
        state.active = true;
        state.proposal = values;
        state.pnum += 1;
        state.ack_count = 0;
        state.nack_count = 0;
        ProposalFrame::propose(round, state.pnum, state.proposal.clone())
    }

    /// Feed one delivered frame from peer `from`.
    pub fn on_frame(&mut self, from: HostId, frame: ProposalFrame) -> Option<Effect> {
        match frame.kind {
            ProposalKind::Propose => Some(self.on_propose(from, frame)),
            ProposalKind::Ack | ProposalKind::Nack => {
                let state = self.rounds.entry(frame.round).or_default();
                if !state.active || frame.pnum != state.pnum {
                    // Reply to a superseded proposal number, or the round
                    // is already decided.
                    return None;
                }
                match frame.kind {
                    ProposalKind::Ack => state.ack_count += 1,
                    ProposalKind::Nack => {
                        state.nack_count += 1;
                        state.proposal.extend(frame.values.iter().copied());
                    }
                    ProposalKind::Propose => unreachable!(),
                }
                self.progress(frame.round)
            }
        }
    }

    /// Acceptor role. Runs even after our own decision so that slower
    /// peers can still reach theirs.
    fn on_propose(&mut self, from: HostId, frame: ProposalFrame) -> Effect {
        let state = self.rounds.entry(frame.round).or_default();
        let reply = if state.accepted.is_subset(&frame.values) {
            state.accepted = frame.values;
            ProposalFrame::ack(frame.round, frame.pnum)
        } else {
            state.accepted.extend(frame.values.iter().copied());
            ProposalFrame::nack(frame.round, frame.pnum, state.accepted.clone())
        };
        Effect::Reply { to: from, frame: reply }
    }

    /// Check the reply counts for our active proposal.
    fn progress(&mut self, round: u64) -> Option<Effect> {
        let state = self.rounds.get_mut(&round)?;
        if state.nack_count >= 1 && state.ack_count + state.nack_count >= self.threshold {
            let values = state.proposal.clone();
            Some(Effect::Broadcast(self.propose(round, values)))
        } else if state.ack_count >= self.threshold {
            state.active = false;
            Some(Effect::Decide {
                round,
                values: state.proposal.clone(),
            })
        } else {
            None
        }
    }
}
