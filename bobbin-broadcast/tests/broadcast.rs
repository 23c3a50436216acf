//! Fleet tests for the broadcast layers over real loopback sockets.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use bobbin_broadcast::{BestEffortBroadcast, FifoBroadcast};
use bobbin_core::frame::BroadcastFrame;
use bobbin_core::host::{Host, HostId, HostTable};
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
    fifo: FifoBroadcast,
    deliveries: mpsc::Receiver<BroadcastFrame>,
}

/// Bring up a fleet of `n` full stacks (link, perfect link, broadcast
/// layers) on loopback.
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
            let (fifo, deliveries) = FifoBroadcast::spawn(beb, pl_rx, id, cancel);
            Node { fifo, deliveries }
        })
        .collect()
}

async fn recv_one(node: &mut Node) -> BroadcastFrame {
    timeout(RECV_TIMEOUT, node.deliveries.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("delivery channel closed")
}

#[tokio::test]
async fn broadcast_reaches_every_node_including_self() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let mut nodes = fleet(3, &cancel).await;

    nodes[0].fifo.broadcast(Bytes::from_static(b"m1")).await;

    for node in &mut nodes {
        let frame = recv_one(node).await;
        assert_eq!(frame.source, HostId(1));
        assert_eq!(frame.bseq, 1);
        assert_eq!(&frame.inner[..], b"m1");
    }
    cancel.cancel();
}

#[tokio::test]
async fn deliveries_respect_per_source_fifo_order() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let mut nodes = fleet(3, &cancel).await;

    for n in 1..=5u64 {
        nodes[0]
            .fifo
            .broadcast(Bytes::from(n.to_string().into_bytes()))
            .await;
    }

    for node in &mut nodes {
        for expected in 1..=5u64 {
            let frame = recv_one(node).await;
            assert_eq!(frame.source, HostId(1));
            assert_eq!(frame.bseq, expected, "bseq must be contiguous from 1");
            assert_eq!(frame.inner, Bytes::from(expected.to_string().into_bytes()));
        }
    }
    cancel.cancel();
}

#[tokio::test]
async fn all_nodes_broadcast_concurrently() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let mut nodes = fleet(3, &cancel).await;

    for node in &nodes {
        for n in 1..=3u64 {
            node.fifo
                .broadcast(Bytes::from(n.to_string().into_bytes()))
                .await;
        }
    }

    // Every node must deliver all nine instances, each source in order.
    for node in &mut nodes {
        let mut next = [1u64; 3];
        for _ in 0..9 {
            let frame = recv_one(node).await;
            let source = usize::from(frame.source.0) - 1;
            assert_eq!(
                frame.bseq, next[source],
                "per-source deliveries must be FIFO"
            );
            next[source] += 1;
        }
    }
    cancel.cancel();
}

#[tokio::test]
async fn single_node_fleet_delivers_its_own_broadcasts() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let mut nodes = fleet(1, &cancel).await;

    nodes[0].fifo.broadcast(Bytes::from_static(b"solo")).await;
    let frame = recv_one(&mut nodes[0]).await;
    assert_eq!(frame.instance(), (HostId(1), 1));
    cancel.cancel();
}

#[tokio::test]
async fn no_duplicate_deliveries_under_load() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let mut nodes = fleet(2, &cancel).await;

    for n in 1..=50u64 {
        nodes[1]
            .fifo
            .broadcast(Bytes::from(n.to_string().into_bytes()))
            .await;
    }

    for node in &mut nodes {
        for expected in 1..=50u64 {
            let frame = recv_one(node).await;
            assert_eq!(frame.instance(), (HostId(2), expected));
        }
        // Nothing further: at most once per instance.
        assert!(
            timeout(Duration::from_millis(300), node.deliveries.recv())
                .await
                .is_err(),
            "unexpected extra delivery"
        );
    }
    cancel.cancel();
}
