//! Adapter that drives the query pool from asynchronous network events.
//!
//! [`PooledQueryBehaviour`] is the only component that touches
//! synchronization. One mutex guards the pool, the FIFO queue of outbound
//! events and the waiter registry, so `Pool::advance` is never entered by two
//! threads at once.
//!
//! Waiter notifications are queued under the lock and delivered after it is
//! released, by one caller at a time and in the order they were produced. A
//! waiter may therefore call back into the behaviour.
//!
//! ## Event translation
//!
//! | Incoming | Pool event | Side effect |
//! |---|---|---|
//! | `StartQuery` | `AddQuery` | registers the waiter, if any |
//! | `StopQuery` | `StopQuery` | closes the waiter, drops unsent requests |
//! | `GetCloserNodesSuccess` | `MessageResponse` | queues `AddAddrInfo`, sends `Progressed` |
//! | `GetCloserNodesFailure` | `MessageFailure` | none |
//!
//! A `QueryMessage` from the pool becomes `OutboundGetCloserNodes`. A finished
//! or timed-out query notifies its waiter once and releases it.
//!
//! ## Driving
//!
//! The driver loop awaits [`PooledQueryBehaviour::ready`] and then calls
//! [`PooledQueryBehaviour::perform`] until it returns `None`. Request and
//! query timeouts are only noticed when the pool is advanced, so the driver
//! should also call `perform` on a periodic tick.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use kadmux_query::{CloserNodesResponse, Pool, PoolConfig, PoolEvent, PoolState, QueryId};
use tracing::{debug, debug_span, error, trace};

use crate::conversion::addr_infos_to_node_infos;
use crate::events::{BehaviourEvent, WaiterEvent};
use crate::identity::{AddrInfo, PeerId};
use crate::notify::{Notify, NotifyHandle, Waiter};
use crate::{CoordError, Result};

/// Runs many lookups through a shared [`Pool`] on behalf of an event loop.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct PooledQueryBehaviour {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    /// Single-slot readiness flag: a signal raised while one is already
    /// pending is absorbed.
    ready: tokio::sync::Notify,
    /// Handed out with every outbound request so responses find their way back.
    handle: NotifyHandle,
}

struct State {
    pool: Pool<PeerId>,
    waiters: HashMap<QueryId, Waiter>,
    pending: VecDeque<BehaviourEvent>,
    deliveries: VecDeque<Delivery>,
    /// Set while some caller is running `deliveries` outside the lock.
    delivering: bool,
}

/// A waiter notification produced under the lock.
enum Delivery {
    /// Progress for a waiter that stays registered.
    Event(Waiter, WaiterEvent),
    /// Final event, if any, after which the waiter is closed.
    Release(Waiter, Option<WaiterEvent>),
}

impl Delivery {
    fn run(self) {
        match self {
            Delivery::Event(waiter, ev) => waiter.notify(ev),
            Delivery::Release(waiter, ev) => {
                if let Some(ev) = ev {
                    waiter.notify(ev);
                }
                waiter.close();
            }
        }
    }
}

/// Result of a single pool advance.
enum Advanced {
    /// An event for the driver.
    Outbound(BehaviourEvent),
    /// A query ended; more work may have been unblocked.
    Progress,
    /// Nothing to do until the next event.
    Quiescent,
}

/// Weak back-reference given to the transport.
struct BehaviourRef(Weak<Inner>);

impl Notify<BehaviourEvent> for BehaviourRef {
    fn notify(&self, ev: BehaviourEvent) {
        match self.0.upgrade() {
            Some(inner) => PooledQueryBehaviour { inner }.notify(ev),
            None => debug!(event = ev.name(), "Behaviour dropped, discarding event"),
        }
    }
}

impl PooledQueryBehaviour {
    /// Wrap an existing pool.
    pub fn new(pool: Pool<PeerId>) -> Self {
        let inner = Arc::new_cyclic(|weak| Inner {
            state: Mutex::new(State {
                pool,
                waiters: HashMap::new(),
                pending: VecDeque::new(),
                deliveries: VecDeque::new(),
                delivering: false,
            }),
            ready: tokio::sync::Notify::new(),
            handle: NotifyHandle::new(BehaviourRef(weak.clone())),
        });
        Self { inner }
    }

    /// Create a behaviour with a fresh pool for the local peer.
    pub fn with_config(local: PeerId, config: PoolConfig) -> Result<Self> {
        Ok(Self::new(Pool::new(local, config)?))
    }

    /// Handle that routes events back into this behaviour.
    pub fn handle(&self) -> NotifyHandle {
        self.inner.handle.clone()
    }

    /// Accept one inbound event and advance the pool as far as it will go.
    ///
    /// Every outbound event produced is queued before this returns.
    ///
    /// # Errors
    ///
    /// - [`CoordError::UnexpectedEvent`] for outbound event kinds.
    /// - [`CoordError::Query`] if a `StartQuery` reuses a live query id or the
    ///   pool's queue is full. The supplied waiter is closed without events.
    pub fn try_notify(&self, ev: BehaviourEvent) -> Result<()> {
        let _span = debug_span!("PooledQueryBehaviour::notify", event = ev.name()).entered();
        let mut state = self.lock();

        let cmd = match ev {
            BehaviourEvent::StartQuery {
                query_id,
                target,
                request,
                known_closest,
                notify,
            } => {
                if let Err(err) = state.pool.check_admission(query_id) {
                    if let Some(waiter) = notify {
                        state.deliveries.push_back(Delivery::Release(waiter, None));
                    }
                    self.deliver(state);
                    return Err(err.into());
                }
                if let Some(waiter) = notify {
                    state.waiters.insert(query_id, waiter);
                }
                PoolEvent::AddQuery {
                    query_id,
                    target,
                    seeds: known_closest,
                    request,
                }
            }
            BehaviourEvent::StopQuery { query_id } => {
                state.stop(query_id);
                PoolEvent::StopQuery { query_id }
            }
            BehaviourEvent::GetCloserNodesSuccess {
                query_id,
                to,
                target,
                closer_nodes,
            } => {
                for info in &closer_nodes {
                    state
                        .pending
                        .push_back(BehaviourEvent::AddAddrInfo { info: info.clone() });
                }
                let response =
                    CloserNodesResponse::new(target, addr_infos_to_node_infos(closer_nodes));
                if let Some(waiter) = state.waiters.get(&query_id).map(Waiter::share) {
                    let ev = WaiterEvent::Progressed {
                        query_id,
                        node_id: to.id,
                        response: response.clone(),
                    };
                    state.deliveries.push_back(Delivery::Event(waiter, ev));
                }
                PoolEvent::MessageResponse {
                    query_id,
                    node_id: to.id,
                    response,
                }
            }
            BehaviourEvent::GetCloserNodesFailure {
                query_id, to, error, ..
            } => PoolEvent::MessageFailure {
                query_id,
                node_id: to.id,
                error,
            },
            ev @ (BehaviourEvent::OutboundGetCloserNodes { .. }
            | BehaviourEvent::AddAddrInfo { .. }) => {
                return Err(CoordError::UnexpectedEvent(ev.name()));
            }
        };

        state.drive(cmd, &self.inner.handle);

        if !state.pending.is_empty() {
            self.inner.ready.notify_one();
        }
        self.deliver(state);
        Ok(())
    }

    /// Wait until outbound events may be pending.
    pub async fn ready(&self) {
        self.inner.ready.notified().await;
    }

    /// Take the next outbound event.
    ///
    /// Queued events are returned first, in the order they were produced.
    /// With an empty queue the pool is polled until it yields an event or has
    /// nothing left to do, in which case `None` is returned.
    pub fn perform(&self) -> Option<BehaviourEvent> {
        let _span = debug_span!("PooledQueryBehaviour::perform").entered();
        let mut state = self.lock();

        let next = loop {
            if let Some(ev) = state.pending.pop_front() {
                if !state.pending.is_empty() {
                    self.inner.ready.notify_one();
                }
                break Some(ev);
            }

            match state.advance_pool(PoolEvent::Poll, &self.inner.handle) {
                Advanced::Outbound(ev) => break Some(ev),
                Advanced::Progress => continue,
                Advanced::Quiescent => break None,
            }
        };
        self.deliver(state);
        next
    }

    /// Number of queries running or waiting for a slot.
    pub fn query_count(&self) -> usize {
        let state = self.lock();
        state.pool.running_count() + state.pool.queued_count()
    }

    /// Run queued waiter notifications with the lock released.
    ///
    /// Returns at once if another caller is already delivering; that caller
    /// picks up whatever was queued here.
    fn deliver<'a>(&'a self, mut state: MutexGuard<'a, State>) {
        if state.delivering {
            return;
        }
        state.delivering = true;
        loop {
            let Some(delivery) = state.deliveries.pop_front() else {
                break;
            };
            drop(state);
            delivery.run();
            state = self.lock();
        }
        state.delivering = false;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Notify<BehaviourEvent> for PooledQueryBehaviour {
    fn notify(&self, ev: BehaviourEvent) {
        if let Err(err) = self.try_notify(ev) {
            error!(%err, "Failed to handle behaviour event");
        }
    }
}

impl State {
    /// Advance the pool with `event`, then poll until it is quiescent,
    /// queueing every outbound event.
    fn drive(&mut self, event: PoolEvent<PeerId>, handle: &NotifyHandle) {
        let mut event = event;
        loop {
            match self.advance_pool(event, handle) {
                Advanced::Outbound(ev) => self.pending.push_back(ev),
                Advanced::Progress => {}
                Advanced::Quiescent => break,
            }
            event = PoolEvent::Poll;
        }
    }

    fn advance_pool(&mut self, event: PoolEvent<PeerId>, handle: &NotifyHandle) -> Advanced {
        let _span = debug_span!("PooledQueryBehaviour::advance_pool").entered();

        match self.pool.advance(event) {
            PoolState::QueryMessage {
                query_id,
                node_id,
                request,
            } => {
                trace!(query_id = %query_id, peer = ?node_id, "Outbound find-closer request");
                Advanced::Outbound(BehaviourEvent::OutboundGetCloserNodes {
                    query_id,
                    to: AddrInfo::from(node_id),
                    target: request.target,
                    notify: handle.clone(),
                })
            }
            PoolState::QueryFinished {
                query_id,
                stats,
                closest,
            } => {
                self.release(
                    query_id,
                    WaiterEvent::Finished {
                        query_id,
                        stats,
                        closest,
                    },
                );
                Advanced::Progress
            }
            PoolState::QueryTimeout { query_id, stats } => {
                self.release(query_id, WaiterEvent::TimedOut { query_id, stats });
                Advanced::Progress
            }
            PoolState::WaitingAtCapacity | PoolState::WaitingWithCapacity | PoolState::Idle => {
                Advanced::Quiescent
            }
        }
    }

    /// Queue the terminal event for the query's waiter and release it.
    fn release(&mut self, query_id: QueryId, ev: WaiterEvent) {
        if let Some(waiter) = self.waiters.remove(&query_id) {
            self.deliveries.push_back(Delivery::Release(waiter, Some(ev)));
        }
    }

    /// Close the query's waiter and drop requests not yet handed to the driver.
    fn stop(&mut self, query_id: QueryId) {
        if let Some(waiter) = self.waiters.remove(&query_id) {
            self.deliveries.push_back(Delivery::Release(waiter, None));
        }
        let before = self.pending.len();
        self.pending.retain(|ev| {
            !matches!(
                ev,
                BehaviourEvent::OutboundGetCloserNodes { query_id: id, .. } if *id == query_id
            )
        });
        debug!(
            query_id = %query_id,
            dropped = before - self.pending.len(),
            "Stopping query"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kadmux_query::{FindCloserRequest, Key, NodeId, QueryError};
    use tokio::sync::mpsc;

    use super::*;
    use crate::identity::PEER_ID_LEN;
    use crate::notify::NotifyCloser;
    use crate::PROTOCOL_ID;

    fn make_peer(id_byte: u8) -> PeerId {
        PeerId::from_public_key([id_byte; PEER_ID_LEN])
    }

    fn make_behaviour(
        concurrency: usize,
        query_concurrency: usize,
        replication: usize,
    ) -> PooledQueryBehaviour {
        let config = PoolConfig {
            concurrency,
            query_concurrency,
            replication,
            max_shortlist: 20,
            ..Default::default()
        };
        PooledQueryBehaviour::with_config(make_peer(0), config).expect("valid config")
    }

    fn start_query(
        id: u64,
        target: Key,
        known_closest: Vec<PeerId>,
    ) -> (BehaviourEvent, mpsc::UnboundedReceiver<WaiterEvent>) {
        let (waiter, rx) = Waiter::channel();
        let ev = BehaviourEvent::StartQuery {
            query_id: QueryId(id),
            target,
            request: FindCloserRequest::new(PROTOCOL_ID, target),
            known_closest,
            notify: Some(waiter),
        };
        (ev, rx)
    }

    /// Starts a follow-up query from inside its terminal callback, then
    /// forwards every event to `events`.
    struct ChainingWaiter {
        handle: NotifyHandle,
        target: Key,
        events: std::sync::mpsc::Sender<WaiterEvent>,
    }

    impl Notify<WaiterEvent> for ChainingWaiter {
        fn notify(&self, ev: WaiterEvent) {
            if ev.is_terminal() {
                self.handle.notify(BehaviourEvent::StartQuery {
                    query_id: QueryId(2),
                    target: self.target,
                    request: FindCloserRequest::new(PROTOCOL_ID, self.target),
                    known_closest: vec![make_peer(2)],
                    notify: None,
                });
            }
            let _ = self.events.send(ev);
        }
    }

    impl NotifyCloser<WaiterEvent> for ChainingWaiter {
        fn close(self: Box<Self>) {}
    }

    fn expect_outbound(ev: Option<BehaviourEvent>) -> (QueryId, AddrInfo, NotifyHandle) {
        match ev {
            Some(BehaviourEvent::OutboundGetCloserNodes {
                query_id,
                to,
                notify,
                ..
            }) => (query_id, to, notify),
            other => panic!("expected OutboundGetCloserNodes, got {other:?}"),
        }
    }

    #[test]
    fn test_start_query_yields_outbound_request() {
        let behaviour = make_behaviour(3, 1, 2);
        let target = make_peer(1).key();
        let (ev, _rx) = start_query(1, target, vec![make_peer(1), make_peer(2)]);
        behaviour.notify(ev);

        let (query_id, to, _) = expect_outbound(behaviour.perform());
        assert_eq!(query_id, QueryId(1));
        assert_eq!(to.id, make_peer(1));
        assert!(behaviour.perform().is_none());
    }

    #[test]
    fn test_outbound_handle_routes_back() {
        let behaviour = make_behaviour(3, 1, 1);
        let target = make_peer(1).key();
        let (ev, mut rx) = start_query(1, target, vec![make_peer(1)]);
        behaviour.notify(ev);

        let (query_id, to, handle) = expect_outbound(behaviour.perform());
        handle.notify(BehaviourEvent::GetCloserNodesSuccess {
            query_id,
            to,
            target,
            closer_nodes: Vec::new(),
        });

        assert!(matches!(rx.try_recv(), Ok(WaiterEvent::Progressed { .. })));
        assert!(matches!(rx.try_recv(), Ok(WaiterEvent::Finished { .. })));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(behaviour.query_count(), 0);
    }

    #[test]
    fn test_success_queues_discovered_addresses_before_next_request() {
        let behaviour = make_behaviour(3, 1, 3);
        let target = make_peer(1).key();
        let (ev, _rx) = start_query(1, target, vec![make_peer(1)]);
        behaviour.notify(ev);
        let (query_id, to, _) = expect_outbound(behaviour.perform());

        let discovered = vec![AddrInfo::from(make_peer(5)), AddrInfo::from(make_peer(6))];
        behaviour.notify(BehaviourEvent::GetCloserNodesSuccess {
            query_id,
            to,
            target,
            closer_nodes: discovered.clone(),
        });

        for expected in &discovered {
            match behaviour.perform() {
                Some(BehaviourEvent::AddAddrInfo { info }) => assert_eq!(&info, expected),
                other => panic!("expected AddAddrInfo, got {other:?}"),
            }
        }
        let (_, to, _) = expect_outbound(behaviour.perform());
        assert!(to.id == make_peer(5) || to.id == make_peer(6));
    }

    #[test]
    fn test_unexpected_event_rejected() {
        let behaviour = make_behaviour(3, 1, 1);
        let err = behaviour
            .try_notify(BehaviourEvent::AddAddrInfo {
                info: AddrInfo::from(make_peer(1)),
            })
            .expect_err("outbound kind");
        assert!(matches!(err, CoordError::UnexpectedEvent("AddAddrInfo")));
        assert!(behaviour.perform().is_none());
    }

    #[test]
    fn test_duplicate_start_closes_new_waiter() {
        let behaviour = make_behaviour(3, 1, 1);
        let target = make_peer(1).key();
        let (ev, mut first_rx) = start_query(1, target, vec![make_peer(1)]);
        behaviour.try_notify(ev).expect("first start");

        let (ev, mut second_rx) = start_query(1, target, vec![make_peer(2)]);
        let err = behaviour.try_notify(ev).expect_err("duplicate");
        assert!(matches!(
            err,
            CoordError::Query(QueryError::DuplicateQuery(QueryId(1)))
        ));
        assert!(matches!(
            second_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        // The first registration is untouched.
        assert!(matches!(
            first_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn test_stop_drops_unsent_requests_and_closes_waiter() {
        let behaviour = make_behaviour(3, 2, 2);
        let target = make_peer(1).key();
        let (ev, mut rx) = start_query(1, target, vec![make_peer(1), make_peer(2)]);
        behaviour.notify(ev);
        behaviour.notify(BehaviourEvent::StopQuery {
            query_id: QueryId(1),
        });

        assert!(behaviour.perform().is_none());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_response_after_stop_ignored() {
        let behaviour = make_behaviour(3, 1, 1);
        let target = make_peer(1).key();
        let (ev, mut rx) = start_query(1, target, vec![make_peer(1)]);
        behaviour.notify(ev);
        let (query_id, to, handle) = expect_outbound(behaviour.perform());

        behaviour.notify(BehaviourEvent::StopQuery { query_id });
        handle.notify(BehaviourEvent::GetCloserNodesSuccess {
            query_id,
            to,
            target,
            closer_nodes: Vec::new(),
        });

        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(behaviour.perform().is_none());
    }

    #[tokio::test]
    async fn test_ready_signalled_when_work_queued() {
        let behaviour = make_behaviour(3, 1, 1);
        let target = make_peer(1).key();
        let (ev, _rx) = start_query(1, target, vec![make_peer(1)]);
        behaviour.notify(ev);

        tokio::time::timeout(Duration::from_secs(1), behaviour.ready())
            .await
            .expect("ready signalled");
        assert!(behaviour.perform().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_query_notifies_waiter() {
        let behaviour = make_behaviour(3, 1, 1);
        let target = make_peer(1).key();
        let (ev, mut rx) = start_query(1, target, vec![make_peer(1)]);
        behaviour.notify(ev);
        expect_outbound(behaviour.perform());

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(behaviour.perform().is_none());

        match rx.recv().await {
            Some(WaiterEvent::TimedOut { query_id, stats }) => {
                assert_eq!(query_id, QueryId(1));
                assert_eq!(stats.requests, 1);
            }
            other => panic!("expected TimedOut, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
        assert_eq!(behaviour.query_count(), 0);
    }

    #[test]
    fn test_handle_outlives_behaviour() {
        let behaviour = make_behaviour(3, 1, 1);
        let handle = behaviour.handle();
        drop(behaviour);
        handle.notify(BehaviourEvent::StopQuery {
            query_id: QueryId(1),
        });
    }

    #[test]
    fn test_waiter_may_call_back_into_behaviour() {
        let behaviour = make_behaviour(3, 1, 1);
        let target = make_peer(1).key();
        let (events_tx, events_rx) = std::sync::mpsc::channel();
        let waiter = Waiter::new(ChainingWaiter {
            handle: behaviour.handle(),
            target,
            events: events_tx,
        });
        behaviour.notify(BehaviourEvent::StartQuery {
            query_id: QueryId(1),
            target,
            request: FindCloserRequest::new(PROTOCOL_ID, target),
            known_closest: vec![make_peer(1)],
            notify: Some(waiter),
        });
        let (query_id, to, handle) = expect_outbound(behaviour.perform());

        let transport = std::thread::spawn(move || {
            handle.notify(BehaviourEvent::GetCloserNodesSuccess {
                query_id,
                to,
                target,
                closer_nodes: Vec::new(),
            });
        });

        let timeout = Duration::from_secs(5);
        assert!(matches!(
            events_rx.recv_timeout(timeout),
            Ok(WaiterEvent::Progressed { .. })
        ));
        assert!(matches!(
            events_rx.recv_timeout(timeout),
            Ok(WaiterEvent::Finished { .. })
        ));
        transport.join().expect("transport thread");

        let (query_id, to, _) = expect_outbound(behaviour.perform());
        assert_eq!(query_id, QueryId(2));
        assert_eq!(to.id, make_peer(2));
        assert_eq!(behaviour.query_count(), 1);
    }

    #[test]
    fn test_progress_precedes_terminal_event() {
        let behaviour = make_behaviour(3, 2, 2);
        let target = make_peer(1).key();
        let (ev, mut rx) = start_query(1, target, vec![make_peer(1), make_peer(2)]);
        behaviour.notify(ev);
        let first = expect_outbound(behaviour.perform());
        let second = expect_outbound(behaviour.perform());

        for (query_id, to, handle) in [first, second] {
            handle.notify(BehaviourEvent::GetCloserNodesSuccess {
                query_id,
                to,
                target,
                closer_nodes: Vec::new(),
            });
        }

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        let (last, progress) = events.split_last().expect("at least one event");
        assert_eq!(progress.len(), 2);
        assert!(progress
            .iter()
            .all(|ev| matches!(ev, WaiterEvent::Progressed { .. })));
        match last {
            WaiterEvent::Finished { closest, .. } => assert_eq!(closest.len(), 2),
            other => panic!("expected Finished, got {other:?}"),
        }
    }
}
