//! Per-milestone drivers wiring the stack to the output log.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use bobbin_broadcast::{BestEffortBroadcast, FifoBroadcast};
use bobbin_core::codec::{decode_text, encode_text};
use bobbin_core::frame::TransportFrame;
use bobbin_core::host::{HostId, HostTable};
use bobbin_lattice::LatticeAgreement;
use bobbin_link::{FairLossLink, PerfectLink};

use crate::config::Milestone;
use crate::output::OutputLog;

/// Bring up the stack for the configured milestone and run it until
/// cancelled. Logs the link's progress counters on the way out.
pub async fn run(
    milestone: Milestone,
    link: FairLossLink,
    local: HostId,
    hosts: HostTable,
    output: Arc<OutputLog>,
    cancel: CancellationToken,
) {
    let (pl, pl_rx) = PerfectLink::spawn(link, local, &hosts, &cancel);

    match milestone {
        Milestone::PerfectLink { messages, receiver } => {
            run_perfect_link(&pl, pl_rx, local, receiver, messages, &output, &cancel).await;
        }
        Milestone::FifoBroadcast { messages } => {
            let beb = BestEffortBroadcast::new(pl.clone(), hosts);
            let (fifo, deliveries) = FifoBroadcast::spawn(beb, pl_rx, local, &cancel);
            run_fifo(&fifo, deliveries, messages, &output, &cancel).await;
        }
        Milestone::LatticeAgreement { proposals } => {
            let beb = BestEffortBroadcast::new(pl.clone(), hosts);
            let (agreement, decisions) = LatticeAgreement::spawn(beb, pl_rx, local, &cancel);
            run_lattice(&agreement, decisions, proposals, &output, &cancel).await;
        }
    }

    let stats = pl.stats();
    info!(
        sent = stats.sent,
        delivered = stats.delivered,
        "link progress at shutdown"
    );
}

/// Perfect-link milestone: non-receivers send `"1"..="messages"` to the
/// receiver; the receiver records deliveries.
#[instrument(skip_all, name = "perfect-link-mode", fields(node = %local))]
async fn run_perfect_link(
    pl: &PerfectLink,
    mut deliveries: mpsc::Receiver<TransportFrame>,
    local: HostId,
    receiver: HostId,
    messages: u64,
    output: &OutputLog,
    cancel: &CancellationToken,
) {
    if local != receiver {
        info!(%receiver, messages, "sending");
        for n in 1..=messages {
            if cancel.is_cancelled() {
                return;
            }
            output.record_broadcast(n);
            pl.send(encode_text(&n.to_string()), receiver).await;
        }
        debug!("all messages enqueued");
    }

    // The receiver records deliveries; senders keep draining so the link's
    // delivery channel never backs up.
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return,
            frame = deliveries.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };
        match decode_text(frame.payload) {
            Ok(text) => output.record_delivery(frame.sender, &text),
            Err(e) => warn!(sender = %frame.sender, error = %e, "dropping non-text payload"),
        }
    }
}

/// FIFO milestone: every process broadcasts `"1"..="messages"` and records
/// all deliveries.
#[instrument(skip_all, name = "fifo-mode")]
async fn run_fifo(
    fifo: &FifoBroadcast,
    mut deliveries: mpsc::Receiver<bobbin_core::frame::BroadcastFrame>,
    messages: u64,
    output: &OutputLog,
    cancel: &CancellationToken,
) {
    let broadcaster = async {
        info!(messages, "broadcasting");
        for n in 1..=messages {
            if cancel.is_cancelled() {
                return;
            }
            // Recorded before the stack takes the message, so the log
            // shows the broadcast even if shutdown drops it in flight.
            output.record_broadcast(n);
            fifo.broadcast(encode_text(&n.to_string())).await;
        }
        debug!("all broadcasts enqueued");
    };

    let deliverer = async {
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return,
                frame = deliveries.recv() => match frame {
                    Some(frame) => frame,
                    None => return,
                },
            };
            match decode_text(frame.inner) {
                Ok(text) => output.record_delivery(frame.source, &text),
                Err(e) => warn!(source = %frame.source, error = %e, "dropping non-text payload"),
            }
        }
    };

    tokio::join!(broadcaster, deliverer);
}

/// Lattice milestone: propose every configured round in order and record
/// decisions as they are released.
#[instrument(skip_all, name = "lattice-mode")]
async fn run_lattice(
    agreement: &LatticeAgreement,
    mut decisions: mpsc::Receiver<bobbin_lattice::Decision>,
    proposals: Vec<std::collections::BTreeSet<i32>>,
    output: &OutputLog,
    cancel: &CancellationToken,
) {
    let proposer = async {
        info!(rounds = proposals.len(), "proposing");
        for (round, values) in proposals.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return;
            }
            agreement.propose(round as u64, values).await;
        }
        debug!("all rounds proposed");
    };

    let decider = async {
        loop {
            let decision = tokio::select! {
                () = cancel.cancelled() => return,
                decision = decisions.recv() => match decision {
                    Some(decision) => decision,
                    None => return,
                },
            };
            output.record_decision(&decision.values);
        }
    };

    tokio::join!(proposer, decider);
}
