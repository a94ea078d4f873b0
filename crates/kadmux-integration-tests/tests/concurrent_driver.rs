//! Integration test: concurrent callers against one behaviour.
//!
//! Exercises the behaviour the way a running node does:
//! 1. A driver task waits on readiness and serves outbound requests from
//!    spawned tasks, which report back through the notify handle
//! 2. Several tasks start lookups at the same time on a multi-threaded runtime
//! 3. Every lookup converges on the true closest peers of a small world
//! 4. A lookup whose peers never answer times out and releases its waiter

use std::sync::Arc;
use std::time::Duration;

use kadmux_coord::{
    AddrInfo, BehaviourEvent, PeerId, PooledQueryBehaviour, Waiter, WaiterEvent, PROTOCOL_ID,
};
use kadmux_query::{FindCloserRequest, Key, NodeId, PoolConfig, QueryId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const REPLICATION: usize = 5;

/// A fully connected world: every peer answers with the peers closest to the
/// requested target.
struct World {
    peers: Vec<AddrInfo>,
}

impl World {
    fn new(size: u8) -> Self {
        let peers = (1..=size)
            .map(|b| AddrInfo::from(PeerId::from_public_key([b; 32])))
            .collect();
        Self { peers }
    }

    fn closest(&self, target: &Key, count: usize) -> Vec<AddrInfo> {
        let mut sorted = self.peers.clone();
        sorted.sort_by_key(|info| info.id.key().distance(target));
        sorted.truncate(count);
        sorted
    }
}

/// Serve outbound requests until aborted. `answer` decides whether peers reply.
fn spawn_driver(
    behaviour: PooledQueryBehaviour,
    world: Arc<World>,
    answer: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(20));
        loop {
            tokio::select! {
                _ = behaviour.ready() => {}
                _ = tick.tick() => {}
            }
            while let Some(event) = behaviour.perform() {
                let BehaviourEvent::OutboundGetCloserNodes {
                    query_id,
                    to,
                    target,
                    notify,
                } = event
                else {
                    continue;
                };
                if !answer {
                    continue;
                }
                let world = Arc::clone(&world);
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    notify.notify(BehaviourEvent::GetCloserNodesSuccess {
                        query_id,
                        to,
                        target,
                        closer_nodes: world.closest(&target, REPLICATION),
                    });
                });
            }
        }
    })
}

/// Collect a waiter's events until it is closed.
async fn collect(mut rx: mpsc::UnboundedReceiver<WaiterEvent>) -> Vec<WaiterEvent> {
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    events
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lookups_converge() {
    let world = Arc::new(World::new(40));
    let config = PoolConfig {
        concurrency: 2,
        replication: REPLICATION,
        ..Default::default()
    };
    let behaviour = PooledQueryBehaviour::with_config(PeerId::from_public_key([0; 32]), config)
        .expect("valid config");
    let driver = spawn_driver(behaviour.clone(), Arc::clone(&world), true);

    let lookups: Vec<JoinHandle<(Key, Vec<WaiterEvent>)>> = (0..8u8)
        .map(|i| {
            let behaviour = behaviour.clone();
            let world = Arc::clone(&world);
            tokio::spawn(async move {
                let target = Key::new([i.wrapping_mul(31); 32]);
                // Start from the peers furthest away so the walk has to move.
                let seeds = world
                    .closest(&target, 40)
                    .into_iter()
                    .rev()
                    .take(3)
                    .map(|info| info.id)
                    .collect();
                let (waiter, rx) = Waiter::channel();
                behaviour
                    .try_notify(BehaviourEvent::StartQuery {
                        query_id: QueryId(u64::from(i)),
                        target,
                        request: FindCloserRequest::new(PROTOCOL_ID, target),
                        known_closest: seeds,
                        notify: Some(waiter),
                    })
                    .expect("query accepted");
                (target, collect(rx).await)
            })
        })
        .collect();

    for lookup in lookups {
        let (target, events) = tokio::time::timeout(Duration::from_secs(10), lookup)
            .await
            .expect("lookup completes")
            .expect("task joins");

        let (last, progress) = events.split_last().expect("at least one event");
        assert!(progress.iter().all(|ev| !ev.is_terminal()));
        match last {
            WaiterEvent::Finished { closest, .. } => {
                let expected: Vec<PeerId> = world
                    .closest(&target, REPLICATION)
                    .into_iter()
                    .map(|info| info.id)
                    .collect();
                assert_eq!(closest, &expected);
            }
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    driver.abort();
    assert_eq!(behaviour.query_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_peers_time_out() {
    let world = Arc::new(World::new(20));
    let behaviour =
        PooledQueryBehaviour::with_config(PeerId::from_public_key([0; 32]), PoolConfig::default())
            .expect("valid config");
    let driver = spawn_driver(behaviour.clone(), Arc::clone(&world), false);

    let target = Key::new([0x5A; 32]);
    let (waiter, rx) = Waiter::channel();
    behaviour
        .try_notify(BehaviourEvent::StartQuery {
            query_id: QueryId(1),
            target,
            request: FindCloserRequest::new(PROTOCOL_ID, target),
            known_closest: world.peers.iter().map(|info| info.id).collect(),
            notify: Some(waiter),
        })
        .expect("query accepted");

    // Paused time auto-advances while every task is idle, so the driver's
    // ticks carry the query through four request expiries and then past
    // its five-minute budget.
    let events = collect(rx).await;
    driver.abort();

    match events.as_slice() {
        [WaiterEvent::TimedOut { query_id, stats }] => {
            assert_eq!(*query_id, QueryId(1));
            assert_eq!(stats.requests, 15);
            assert_eq!(stats.failure, 12);
            assert!(stats
                .duration()
                .is_some_and(|d| d >= Duration::from_secs(300)));
        }
        other => panic!("expected a single TimedOut event, got {other:?}"),
    }
    assert_eq!(behaviour.query_count(), 0);
}
