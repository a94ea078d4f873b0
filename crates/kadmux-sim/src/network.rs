//! In-memory network of simulated peers.
//!
//! Each peer knows a random subset of the others. A find-closer request is
//! answered from the contacted peer's table after a random delay, or fails
//! with probability `failure_rate`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kadmux_coord::{AddrInfo, BehaviourEvent, NotifyHandle, PeerId, PooledQueryBehaviour};
use kadmux_query::{Key, NodeId, QueryId};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::config::NetworkConfig;

/// A set of simulated peers and the tables they answer from.
pub struct Network {
    peers: Vec<AddrInfo>,
    tables: HashMap<PeerId, Vec<AddrInfo>>,
    failure_rate: f64,
    max_latency_ms: u64,
    replication: usize,
}

impl Network {
    /// Build a network of `config.nodes` random peers.
    ///
    /// Peers answer requests with at most `replication` entries.
    pub fn generate(config: &NetworkConfig, replication: usize) -> Self {
        let mut rng = rand::thread_rng();

        // One endpoint per peer in 10.0.0.1 through 10.255.255.1.
        let peers: Vec<AddrInfo> = (0..=u16::MAX)
            .take(config.nodes)
            .map(|i| {
                let id = PeerId::from_public_key(rng.gen());
                let [hi, lo] = i.to_be_bytes();
                let addr = SocketAddr::from(([10, hi, lo, 1], 4433));
                AddrInfo::new(id, vec![addr])
            })
            .collect();

        let table_size = config.table_size.min(peers.len().saturating_sub(1));
        let tables = peers
            .iter()
            .map(|peer| {
                let table: Vec<AddrInfo> = peers
                    .iter()
                    .filter(|other| other.id != peer.id)
                    .cloned()
                    .collect::<Vec<_>>()
                    .choose_multiple(&mut rng, table_size)
                    .cloned()
                    .collect();
                (peer.id, table)
            })
            .collect();

        Self {
            peers,
            tables,
            failure_rate: config.failure_rate,
            max_latency_ms: config.max_latency_ms,
            replication,
        }
    }

    /// Number of peers in the network.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// `count` peers chosen at random.
    pub fn random_peers(&self, count: usize) -> Vec<PeerId> {
        self.peers
            .choose_multiple(&mut rand::thread_rng(), count)
            .map(|info| info.id)
            .collect()
    }

    /// The `count` peers closest to `target` across the whole network.
    pub fn closest(&self, target: &Key, count: usize) -> Vec<PeerId> {
        closest_to(&self.peers, target, count)
            .into_iter()
            .map(|info| info.id)
            .collect()
    }

    /// What `peer` answers when asked for nodes close to `target`.
    fn answer(&self, peer: &PeerId, target: &Key) -> Option<Vec<AddrInfo>> {
        self.tables
            .get(peer)
            .map(|table| closest_to(table, target, self.replication))
    }

    /// Serve one outbound request on a background task.
    pub fn serve(
        self: &Arc<Self>,
        query_id: QueryId,
        to: AddrInfo,
        target: Key,
        notify: NotifyHandle,
    ) {
        let (delay, fail) = {
            let mut rng = rand::thread_rng();
            let delay = Duration::from_millis(rng.gen_range(0..=self.max_latency_ms));
            (delay, rng.gen_bool(self.failure_rate))
        };
        let network = Arc::clone(self);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let answer = if fail {
                None
            } else {
                network.answer(&to.id, &target)
            };
            let event = match answer {
                Some(closer_nodes) => {
                    trace!(
                        query_id = %query_id,
                        peer = ?to.id,
                        returned = closer_nodes.len(),
                        "Peer answered"
                    );
                    BehaviourEvent::GetCloserNodesSuccess {
                        query_id,
                        to,
                        target,
                        closer_nodes,
                    }
                }
                None => {
                    trace!(query_id = %query_id, peer = ?to.id, "Request failed");
                    BehaviourEvent::GetCloserNodesFailure {
                        query_id,
                        to,
                        target,
                        error: "request failed".to_string(),
                    }
                }
            };
            notify.notify(event);
        });
    }
}

fn closest_to(infos: &[AddrInfo], target: &Key, count: usize) -> Vec<AddrInfo> {
    let mut sorted = infos.to_vec();
    sorted.sort_by_key(|info| info.id.key().distance(target));
    sorted.truncate(count);
    sorted
}

/// Endpoints learned from `AddAddrInfo` events.
pub type AddressBook = Arc<Mutex<HashMap<PeerId, Vec<SocketAddr>>>>;

/// Run the driver loop until the task is aborted.
///
/// Outbound requests are served by `network`. The loop also wakes every
/// `tick` so expired requests and queries are noticed without traffic.
pub async fn drive(
    behaviour: PooledQueryBehaviour,
    network: Arc<Network>,
    address_book: AddressBook,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick);

    loop {
        tokio::select! {
            _ = behaviour.ready() => {}
            _ = interval.tick() => {}
        }

        while let Some(event) = behaviour.perform() {
            match event {
                BehaviourEvent::OutboundGetCloserNodes {
                    query_id,
                    to,
                    target,
                    notify,
                } => network.serve(query_id, to, target, notify),
                BehaviourEvent::AddAddrInfo { info } => {
                    debug!(peer = ?info.id, addrs = info.addrs.len(), "Learned peer");
                    address_book.lock().await.insert(info.id, info.addrs);
                }
                other => warn!(event = other.name(), "Ignoring inbound event from perform"),
            }
        }
    }
}
