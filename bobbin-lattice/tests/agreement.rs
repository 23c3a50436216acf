//! Fleet tests for lattice agreement over real loopback sockets.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use bobbin_broadcast::BestEffortBroadcast;
use bobbin_core::host::{Host, HostId, HostTable};
use bobbin_lattice::{Decision, LatticeAgreement};
use bobbin_link::{FairLossLink, PerfectLink};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize tracing for tests. Call at the start of each test.
/// Uses RUST_LOG env var for filtering (defaults to "warn").
fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .finish();

    // Set as the default for this thread only so parallel tests don't fight
    // over the global dispatcher.
    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

struct Node {
    agreement: LatticeAgreement,
    decisions: mpsc::Receiver<Decision>,
}

async fn fleet(n: u16, cancel: &CancellationToken) -> Vec<Node> {
    let mut links = Vec::new();
    let mut hosts = Vec::new();
    for id in 1..=n {
        let link = FairLossLink::bind("127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind loopback");
        hosts.push(Host {
            id: HostId(id),
            addr: link.local_addr().expect("local addr"),
        });
        links.push(link);
    }
    let table = HostTable::new(hosts).expect("valid table");

    links
        .into_iter()
        .enumerate()
        .map(|(i, link)| {
            let id = HostId(u16::try_from(i + 1).unwrap());
            let (pl, pl_rx) = PerfectLink::spawn(link, id, &table, cancel);
            let beb = BestEffortBroadcast::new(pl, table.clone());
            let (agreement, decisions) = LatticeAgreement::spawn(beb, pl_rx, id, cancel);
            Node {
                agreement,
                decisions,
            }
        })
        .collect()
}

fn set(values: &[i32]) -> BTreeSet<i32> {
    values.iter().copied().collect()
}

async fn next_decision(node: &mut Node) -> Decision {
    timeout(RECV_TIMEOUT, node.decisions.recv())
        .await
        .expect("timed out waiting for decision")
        .expect("decision channel closed")
}

#[tokio::test]
async fn identical_proposals_decide_unchanged() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let mut nodes = fleet(3, &cancel).await;

    for node in &nodes {
        node.agreement.propose(0, set(&[1, 2])).await;
    }
    for node in &mut nodes {
        let decision = next_decision(node).await;
        assert_eq!(decision.round, 0);
        assert_eq!(decision.values, set(&[1, 2]));
    }
    cancel.cancel();
}

#[tokio::test]
async fn conflicting_proposals_decide_comparable_supersets() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let mut nodes = fleet(3, &cancel).await;

    for (i, node) in nodes.iter().enumerate() {
        let own = i32::try_from(i + 1).unwrap();
        node.agreement.propose(0, set(&[own])).await;
    }

    let mut decided = Vec::new();
    for (i, node) in nodes.iter_mut().enumerate() {
        let own = i32::try_from(i + 1).unwrap();
        let decision = next_decision(node).await;
        assert_eq!(decision.round, 0);
        assert!(
            decision.values.contains(&own),
            "decision must contain the local proposal"
        );
        assert!(
            decision.values.is_subset(&set(&[1, 2, 3])),
            "decision must stay within the joined proposals"
        );
        decided.push(decision.values);
    }

    // Consistency: decisions are totally ordered by inclusion.
    for a in &decided {
        for b in &decided {
            assert!(
                a.is_subset(b) || b.is_subset(a),
                "incomparable decisions {a:?} and {b:?}"
            );
        }
    }
    cancel.cancel();
}

#[tokio::test]
async fn single_node_decides_its_own_proposal() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let mut nodes = fleet(1, &cancel).await;

    nodes[0].agreement.propose(0, set(&[7, -3])).await;
    let decision = next_decision(&mut nodes[0]).await;
    assert_eq!(decision.round, 0);
    assert_eq!(decision.values, set(&[7, -3]));
    cancel.cancel();
}

#[tokio::test]
async fn empty_proposal_decides_the_join_of_deliveries() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let mut nodes = fleet(2, &cancel).await;

    nodes[0].agreement.propose(0, BTreeSet::new()).await;
    nodes[1].agreement.propose(0, set(&[4])).await;

    for node in &mut nodes {
        let decision = next_decision(node).await;
        assert!(decision.values.is_subset(&set(&[4])));
    }
    cancel.cancel();
}

#[tokio::test]
async fn decisions_arrive_in_round_order() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let mut nodes = fleet(3, &cancel).await;

    let rounds = 20u64;
    for node in &nodes {
        let agreement = node.agreement.clone();
        tokio::spawn(async move {
            for round in 0..rounds {
                let base = i32::try_from(round).unwrap();
                agreement.propose(round, set(&[base, base + 1])).await;
            }
        });
    }

    for node in &mut nodes {
        for expected in 0..rounds {
            let decision = next_decision(node).await;
            assert_eq!(
                decision.round, expected,
                "decisions must be released in round order with no gaps"
            );
            let base = i32::try_from(expected).unwrap();
            assert!(decision.values.contains(&base));
            assert!(decision.values.contains(&(base + 1)));
        }
    }
    cancel.cancel();
}
