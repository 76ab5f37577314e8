use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::time::{self, Instant};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use floodsub::{FloodSubConfig, MemoryNetwork, MemoryTransport, Node, PeerId};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Topology {
    /// Each node links to the next one.
    Line,
    /// A line whose last node links back to the first.
    Ring,
    /// Every node links to node 0.
    Star,
    /// Every pair of nodes is linked.
    Full,
}

impl Topology {
    fn edges(self, n: usize) -> Vec<(usize, usize)> {
        match self {
            Topology::Line => (1..n).map(|i| (i - 1, i)).collect(),
            Topology::Ring => {
                let mut edges: Vec<_> = (1..n).map(|i| (i - 1, i)).collect();
                if n > 2 {
                    edges.push((n - 1, 0));
                }
                edges
            }
            Topology::Star => (1..n).map(|i| (0, i)).collect(),
            Topology::Full => (0..n)
                .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
                .collect(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "floodsub-sim")]
#[command(author, version, about = "Flood a topic through a simulated in-memory overlay", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "5")]
    nodes: usize,

    #[arg(long, value_enum, default_value = "ring")]
    topology: Topology,

    #[arg(long, default_value = "sim")]
    topic: String,

    /// Messages published by the publisher node.
    #[arg(short, long, default_value = "3")]
    messages: usize,

    /// Index of the publishing node.
    #[arg(short, long, default_value = "0")]
    publisher: usize,

    /// Wait this long for subscriptions and deliveries to settle.
    #[arg(long, default_value = "2000")]
    settle_ms: u64,

    #[arg(long, default_value_t = floodsub::DEFAULT_SEEN_CACHE_CAPACITY)]
    seen_cache: usize,
}

async fn wait_until_subscribed(nodes: &[Node<MemoryTransport>], topic: &str, deadline: Instant) -> bool {
    loop {
        let mut ready = true;
        for node in nodes {
            let expected = node.peers().await.len();
            if node.subscribers(topic).await.len() < expected {
                ready = false;
                break;
            }
        }
        if ready {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if args.nodes < 2 {
        anyhow::bail!("need at least two nodes");
    }
    if args.publisher >= args.nodes {
        anyhow::bail!("publisher index {} out of range", args.publisher);
    }

    let config = FloodSubConfig {
        seen_cache_capacity: args.seen_cache,
        ..Default::default()
    };

    let network = MemoryNetwork::new();
    let nodes: Vec<Node<MemoryTransport>> = (0..args.nodes)
        .map(|_| Node::with_config(network.transport(PeerId::random()), config.clone()))
        .collect();

    for (i, node) in nodes.iter().enumerate() {
        node.start().await.with_context(|| format!("failed to start node {}", i))?;
        info!(index = i, peer = %node.peer_id().short(), "node up");
    }

    let edges = args.topology.edges(args.nodes);
    for &(a, b) in &edges {
        nodes[a]
            .connect(&nodes[b].peer_id())
            .await
            .with_context(|| format!("failed to link node {} to node {}", a, b))?;
    }
    info!(topology = ?args.topology, edges = edges.len(), "overlay linked");

    let mut receivers = Vec::with_capacity(nodes.len());
    for node in &nodes {
        receivers.push(node.messages(&args.topic));
        node.subscribe(&args.topic).await?;
    }

    let settle = Duration::from_millis(args.settle_ms);
    if !wait_until_subscribed(&nodes, &args.topic, Instant::now() + settle).await {
        warn!("subscriptions did not fully propagate before publishing");
    }

    let publisher = &nodes[args.publisher];
    for i in 0..args.messages {
        let id = publisher
            .publish(&args.topic, format!("message {}", i).into_bytes())
            .await?;
        info!(msg_id = %hex::encode(&id[..8]), "published");
    }

    let deadline = Instant::now() + settle;
    let mut complete = true;
    for (i, rx) in receivers.iter_mut().enumerate() {
        let mut received = 0;
        while received < args.messages {
            match time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(_)) => received += 1,
                Ok(Err(e)) => {
                    warn!(index = i, error = %e, "delivery channel error");
                    break;
                }
                Err(_) => break,
            }
        }
        if received < args.messages {
            complete = false;
        }
        info!(
            index = i,
            peer = %nodes[i].peer_id().short(),
            received,
            expected = args.messages,
            "deliveries"
        );
    }

    for node in &nodes {
        node.stop().await?;
    }

    if complete {
        info!("every node received every message exactly once");
        Ok(())
    } else {
        anyhow::bail!("some nodes missed messages")
    }
}
