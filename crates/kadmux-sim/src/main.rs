//! kadmux-sim: runs concurrent lookups against an in-memory network.
//!
//! The simulator wires a [`PooledQueryBehaviour`] to a driver loop the way a
//! networked node would, with the transport replaced by [`network::Network`].
//! Each lookup's outcome is compared against the true closest peers.

mod config;
mod network;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kadmux_coord::{BehaviourEvent, PeerId, PooledQueryBehaviour, Waiter, WaiterEvent, PROTOCOL_ID};
use kadmux_query::{FindCloserRequest, Key, NodeId, QueryId};
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::config::SimConfig;
use crate::network::Network;

/// How a single lookup ended.
#[derive(Debug)]
enum Outcome {
    Finished { closest: Vec<PeerId>, requests: usize },
    TimedOut { requests: usize },
    Closed,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kadmux=info".parse()?),
        )
        .init();

    info!("kadmux simulator starting");

    // 1. Load config
    let config = SimConfig::load().context("loading simulator config")?;

    // 2. Build the network and the local behaviour
    let network = Arc::new(Network::generate(&config.network, config.pool.replication));
    let local = PeerId::from_public_key(rand::thread_rng().gen());
    let behaviour = PooledQueryBehaviour::with_config(local, config.pool.clone())
        .context("creating query behaviour")?;
    info!(
        peers = network.peer_count(),
        queries = config.network.queries,
        concurrency = config.pool.concurrency,
        "Network ready"
    );

    // 3. Start the driver loop
    let address_book = Arc::new(Mutex::new(HashMap::new()));
    let driver = tokio::spawn(network::drive(
        behaviour.clone(),
        Arc::clone(&network),
        Arc::clone(&address_book),
        Duration::from_millis(config.network.tick_ms),
    ));

    // 4. Start lookups
    let mut lookups = Vec::with_capacity(config.network.queries);
    for i in 0..config.network.queries {
        let query_id = QueryId(i as u64);
        let target = Key::new(rand::thread_rng().gen());
        let mut seeds = network.random_peers(config.network.bootstrap_peers);
        seeds.sort_by_key(|peer| peer.key().distance(&target));

        let (waiter, rx) = Waiter::channel();
        behaviour
            .try_notify(BehaviourEvent::StartQuery {
                query_id,
                target,
                request: FindCloserRequest::new(PROTOCOL_ID, target),
                known_closest: seeds,
                notify: Some(waiter),
            })
            .with_context(|| format!("starting query {query_id}"))?;
        lookups.push((query_id, target, tokio::spawn(wait_for_outcome(rx))));
    }

    // 5. Collect outcomes
    let mut finished = 0usize;
    for (query_id, target, handle) in lookups {
        match handle.await.context("waiter task panicked")? {
            Outcome::Finished { closest, requests } => {
                finished += 1;
                let expected = network.closest(&target, closest.len());
                let hits = closest.iter().filter(|peer| expected.contains(peer)).count();
                info!(
                    query_id = %query_id,
                    requests,
                    found = closest.len(),
                    hits,
                    "Lookup finished"
                );
            }
            Outcome::TimedOut { requests } => {
                warn!(query_id = %query_id, requests, "Lookup timed out");
            }
            Outcome::Closed => warn!(query_id = %query_id, "Lookup closed without result"),
        }
    }

    driver.abort();
    let learned_peers = address_book.lock().await.len();
    info!(
        finished,
        total = config.network.queries,
        learned_peers,
        "Simulation complete"
    );
    Ok(())
}

/// Consume a waiter's events until its terminal one.
async fn wait_for_outcome(mut rx: mpsc::UnboundedReceiver<WaiterEvent>) -> Outcome {
    while let Some(event) = rx.recv().await {
        match event {
            WaiterEvent::Progressed { .. } => {}
            WaiterEvent::Finished { stats, closest, .. } => {
                return Outcome::Finished {
                    closest,
                    requests: stats.requests,
                }
            }
            WaiterEvent::TimedOut { stats, .. } => {
                return Outcome::TimedOut {
                    requests: stats.requests,
                }
            }
        }
    }
    Outcome::Closed
}
