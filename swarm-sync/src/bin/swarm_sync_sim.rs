use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use swarm_sync::core::identity::PeerId;
use swarm_sync::models::simple::LinearModel;
use swarm_sync::net::mock::{MemoryStore, MockDirectory, RendezvousReducer};
use swarm_sync::runtime::mock_runtime::MockRuntime;
use swarm_sync::{SyncConfig, SyncNode, TickReport};

const DIM: usize = 8;
const MIN_BATCH: u64 = 4;
const MAX_BATCH: u64 = 16;
const NOISE: f32 = 0.05;

type SimNode = SyncNode<MockDirectory, RendezvousReducer, MemoryStore, LinearModel, MockRuntime>;

fn usage() -> ! {
    eprintln!("Usage: swarm_sync_sim <peers> <rounds>");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  RUST_LOG=swarm_sync=debug swarm_sync_sim 4 10");
    std::process::exit(2);
}

fn parse_args() -> (usize, usize) {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.len() != 2 {
        usage();
    }
    match (args[0].parse::<usize>(), args[1].parse::<usize>()) {
        (Ok(peers), Ok(rounds)) if peers > 0 => (peers, rounds),
        _ => usage(),
    }
}

fn build_nodes(peers: usize) -> swarm_sync::Result<(Vec<SimNode>, MemoryStore)> {
    let ids: Vec<PeerId> = (0..peers)
        .map(|i| PeerId::from_public_key(format!("sim-peer-{i}").as_bytes()))
        .collect();

    let store = MemoryStore::new();
    let directory = MockDirectory::new(ids.iter().copied());
    directory.link_store(store.clone());
    let reducer = Arc::new(RendezvousReducer::new());
    let runtime = MockRuntime::new();

    let config = SyncConfig::builder()
        .min_group_size(peers)
        .round_due_sample_threshold(MIN_BATCH)
        .round_timeout(Duration::from_secs(30))
        .build()?;

    let nodes = ids
        .into_iter()
        .map(|id| {
            let model = LinearModel::new(DIM, config.learning_rate, config.momentum).with_random_init(7);
            SyncNode::new(
                id,
                config.clone(),
                Arc::new(directory.clone()),
                Arc::clone(&reducer),
                Arc::new(store.clone()),
                model,
                Arc::new(runtime.clone()),
            )
        })
        .collect::<swarm_sync::Result<Vec<_>>>()?;
    Ok((nodes, store))
}

async fn simulate(peers: usize, rounds: usize) -> swarm_sync::Result<()> {
    let (mut nodes, store) = build_nodes(peers)?;
    let target: Vec<f32> = (0..DIM).map(|i| i as f32 / DIM as f32).collect();
    // Each peer sees its own noisy view of the target and its own batch sizes.
    let mut data: Vec<StdRng> = (0..peers as u64).map(StdRng::seed_from_u64).collect();

    for round in 0..rounds {
        for (node, rng) in nodes.iter_mut().zip(data.iter_mut()) {
            let local_target: Vec<f32> = target
                .iter()
                .map(|t| t + rng.gen_range(-NOISE..NOISE))
                .collect();
            let gradient = node.model().loss_gradient(&local_target);
            node.record_samples(&gradient, rng.gen_range(MIN_BATCH..=MAX_BATCH))?;
        }

        let reports = join_all(nodes.iter_mut().map(|node| node.tick())).await;
        for (node, report) in nodes.iter().zip(reports) {
            match report? {
                TickReport::Published { epoch } => {
                    tracing::info!(round, peer = %node.self_id(), epoch, "published")
                }
                report => tracing::debug!(round, peer = %node.self_id(), ?report, "tick"),
            }
        }
    }

    println!("store tags: {:?}", store.tags());
    for node in &nodes {
        let distance: f32 = node
            .model()
            .loss_gradient(&target)
            .iter()
            .map(|g| g * g)
            .sum::<f32>()
            .sqrt();
        println!(
            "peer {}: epoch {} distance {distance:.4}",
            node.self_id(),
            node.local().epoch
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (peers, rounds) = parse_args();
    if let Err(e) = simulate(peers, rounds).await {
        tracing::error!(error = %e, fatal = e.is_fatal(), "simulation aborted");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
