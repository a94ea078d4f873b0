//! Scheduler that runs many queries under shared concurrency limits.
//!
//! The [`Pool`] owns every [`Query`] and is driven by
//! [`Pool::advance`]: each call applies one [`PoolEvent`] and returns one
//! [`PoolState`]. A single event can unblock several pieces of work, so the
//! caller keeps advancing with [`PoolEvent::Poll`] until the pool reports a
//! waiting or idle state.
//!
//! ## Scheduling
//!
//! - At most `concurrency` queries run at once. A running query holds its
//!   slot until it finishes, times out or is stopped.
//! - Queries added while the pool is full wait in FIFO order, up to
//!   `max_pending` of them.
//! - Running queries are serviced oldest first; each bounds its own
//!   outstanding requests at `query_concurrency`.
//!
//! Node failures are handed to the owning query and never surface as errors.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::key::{Key, NodeId, NodeInfo};
use crate::query::{Query, QueryEvent, QueryId, QueryState, QueryStats};
use crate::{QueryError, Result};

/// Request template sent to every node a query contacts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindCloserRequest {
    /// Protocol the request is sent over.
    pub protocol_id: String,
    /// Key whose closest nodes are requested.
    pub target: Key,
}

impl FindCloserRequest {
    /// Create a request for `target` over `protocol_id`.
    pub fn new(protocol_id: impl Into<String>, target: Key) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            target,
        }
    }
}

/// A node's answer to a [`FindCloserRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloserNodesResponse<N> {
    /// The key that was asked about.
    pub target: Key,
    /// Nodes the responder knows that are close to `target`.
    pub closer_nodes: Vec<NodeInfo<N>>,
}

impl<N: NodeId> CloserNodesResponse<N> {
    /// Build a response for `target`.
    pub fn new(target: Key, closer_nodes: Vec<NodeInfo<N>>) -> Self {
        Self {
            target,
            closer_nodes,
        }
    }

    fn closer_ids(&self) -> Vec<N> {
        self.closer_nodes.iter().map(|info| info.id.clone()).collect()
    }
}

/// Input to [`Pool::advance`].
#[derive(Clone, Debug)]
pub enum PoolEvent<N> {
    /// Start a new query, or queue it if the pool is full.
    AddQuery {
        query_id: QueryId,
        target: Key,
        /// Initial candidates, usually the closest entries of the routing table.
        seeds: Vec<N>,
        request: FindCloserRequest,
    },
    /// Abandon a running or queued query.
    StopQuery { query_id: QueryId },
    /// A node answered a request sent on behalf of `query_id`.
    MessageResponse {
        query_id: QueryId,
        node_id: N,
        response: CloserNodesResponse<N>,
    },
    /// A request sent on behalf of `query_id` failed.
    MessageFailure {
        query_id: QueryId,
        node_id: N,
        error: String,
    },
    /// No new information; report the next unit of work.
    Poll,
}

/// Output of [`Pool::advance`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolState<N> {
    /// Send `request` to `node_id` on behalf of `query_id`.
    QueryMessage {
        query_id: QueryId,
        node_id: N,
        request: FindCloserRequest,
    },
    /// Every slot is taken and no running query has work ready.
    WaitingAtCapacity,
    /// Slots are free but no running query has work ready.
    WaitingWithCapacity,
    /// A query converged. It has been removed from the pool.
    QueryFinished {
        query_id: QueryId,
        stats: QueryStats,
        /// The closest nodes that responded, nearest first.
        closest: Vec<N>,
    },
    /// A query exceeded its time budget. It has been removed from the pool.
    QueryTimeout { query_id: QueryId, stats: QueryStats },
    /// The pool holds no queries.
    Idle,
}

struct Running<N: NodeId> {
    query: Query<N>,
    request: FindCloserRequest,
}

struct Queued<N> {
    query_id: QueryId,
    target: Key,
    seeds: Vec<N>,
    request: FindCloserRequest,
}

/// A pool of concurrently running queries.
pub struct Pool<N: NodeId> {
    local: N,
    config: PoolConfig,
    running: HashMap<QueryId, Running<N>>,
    /// Running query ids in admission order.
    order: Vec<QueryId>,
    queued: VecDeque<Queued<N>>,
}

impl<N: NodeId> Pool<N> {
    /// Create an empty pool for the node identified by `local`.
    pub fn new(local: N, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            local,
            config,
            running: HashMap::new(),
            order: Vec::new(),
            queued: VecDeque::new(),
        })
    }

    /// The pool's configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of queries currently holding a slot.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Number of queries waiting for a slot.
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// Whether `query_id` is running or queued.
    pub fn contains(&self, query_id: QueryId) -> bool {
        self.running.contains_key(&query_id) || self.queued.iter().any(|q| q.query_id == query_id)
    }

    /// The running query with id `query_id`.
    pub fn query(&self, query_id: QueryId) -> Option<&Query<N>> {
        self.running.get(&query_id).map(|r| &r.query)
    }

    /// Check whether a query with `query_id` would be accepted right now.
    pub fn check_admission(&self, query_id: QueryId) -> Result<()> {
        if self.contains(query_id) {
            return Err(QueryError::DuplicateQuery(query_id));
        }
        let would_queue =
            self.running.len() >= self.config.concurrency || !self.queued.is_empty();
        if would_queue && self.queued.len() >= self.config.max_pending {
            return Err(QueryError::QueueFull {
                max: self.config.max_pending,
            });
        }
        Ok(())
    }

    /// Apply `event` and return the next unit of work.
    pub fn advance(&mut self, event: PoolEvent<N>) -> PoolState<N> {
        self.advance_at(event, Instant::now())
    }

    fn advance_at(&mut self, event: PoolEvent<N>, now: Instant) -> PoolState<N> {
        match event {
            PoolEvent::AddQuery {
                query_id,
                target,
                seeds,
                request,
            } => {
                let queued = Queued {
                    query_id,
                    target,
                    seeds,
                    request,
                };
                if let Err(err) = self.add_query(queued, now) {
                    warn!(query_id = %query_id, %err, "Rejecting query");
                }
            }
            PoolEvent::StopQuery { query_id } => self.stop_query(query_id),
            PoolEvent::MessageResponse {
                query_id,
                node_id,
                response,
            } => {
                let event = QueryEvent::FindCloserResponse {
                    node: node_id,
                    closer: response.closer_ids(),
                };
                if let Some(state) = self.advance_query(query_id, event, now) {
                    return state;
                }
            }
            PoolEvent::MessageFailure {
                query_id,
                node_id,
                error,
            } => {
                let event = QueryEvent::FindCloserFailure {
                    node: node_id,
                    error,
                };
                if let Some(state) = self.advance_query(query_id, event, now) {
                    return state;
                }
            }
            PoolEvent::Poll => {}
        }

        if let Some(state) = self.expire_queries(now) {
            return state;
        }

        self.admit_queued(now);

        for i in 0..self.order.len() {
            let query_id = self.order[i];
            if let Some(state) = self.advance_query(query_id, QueryEvent::Poll, now) {
                return state;
            }
        }

        if self.running.is_empty() {
            PoolState::Idle
        } else if self.running.len() >= self.config.concurrency {
            PoolState::WaitingAtCapacity
        } else {
            PoolState::WaitingWithCapacity
        }
    }

    fn add_query(&mut self, queued: Queued<N>, now: Instant) -> Result<()> {
        self.check_admission(queued.query_id)?;

        if self.running.len() < self.config.concurrency && self.queued.is_empty() {
            self.start_query(queued, now);
        } else {
            debug!(
                query_id = %queued.query_id,
                position = self.queued.len(),
                "Pool at capacity, queueing query"
            );
            self.queued.push_back(queued);
        }
        Ok(())
    }

    fn start_query(&mut self, queued: Queued<N>, now: Instant) {
        let Queued {
            query_id,
            target,
            seeds,
            request,
        } = queued;

        info!(query_id = %query_id, %target, seeds = seeds.len(), "Starting query");

        let query = Query::new(
            query_id,
            self.local.clone(),
            target,
            seeds,
            self.config.query_config(),
            now,
        );
        self.running.insert(query_id, Running { query, request });
        self.order.push(query_id);
    }

    fn admit_queued(&mut self, now: Instant) {
        while self.running.len() < self.config.concurrency {
            match self.queued.pop_front() {
                Some(queued) => self.start_query(queued, now),
                None => break,
            }
        }
    }

    fn stop_query(&mut self, query_id: QueryId) {
        if self.remove(query_id).is_some() {
            info!(query_id = %query_id, "Query stopped");
            return;
        }
        if let Some(pos) = self.queued.iter().position(|q| q.query_id == query_id) {
            self.queued.remove(pos);
            info!(query_id = %query_id, "Queued query stopped");
            return;
        }
        debug!(query_id = %query_id, "Stop requested for unknown query");
    }

    fn remove(&mut self, query_id: QueryId) -> Option<Running<N>> {
        let running = self.running.remove(&query_id)?;
        self.order.retain(|id| *id != query_id);
        Some(running)
    }

    /// Advance one running query. Returns `None` if the query has nothing to
    /// report or is not running.
    fn advance_query(
        &mut self,
        query_id: QueryId,
        event: QueryEvent<N>,
        now: Instant,
    ) -> Option<PoolState<N>> {
        let Some(running) = self.running.get_mut(&query_id) else {
            debug!(query_id = %query_id, "Ignoring event for query not in pool");
            return None;
        };

        match running.query.advance(event, now) {
            QueryState::FindCloser { node } => Some(PoolState::QueryMessage {
                query_id,
                node_id: node,
                request: running.request.clone(),
            }),
            QueryState::Finished => {
                let running = self.remove(query_id)?;
                let stats = *running.query.stats();
                info!(
                    query_id = %query_id,
                    requests = stats.requests,
                    success = stats.success,
                    failure = stats.failure,
                    "Query finished"
                );
                Some(PoolState::QueryFinished {
                    query_id,
                    stats,
                    closest: running.query.closest_nodes(),
                })
            }
            QueryState::WaitingAtCapacity | QueryState::WaitingWithCapacity => None,
        }
    }

    /// Remove the oldest query that has run past the pool timeout.
    fn expire_queries(&mut self, now: Instant) -> Option<PoolState<N>> {
        let timeout = self.config.timeout();
        let query_id = self.order.iter().copied().find(|id| {
            self.running.get(id).is_some_and(|r| {
                now.saturating_duration_since(r.query.stats().start) >= timeout
            })
        })?;

        let running = self.remove(query_id)?;
        let mut stats = *running.query.stats();
        stats.end = Some(now);
        warn!(query_id = %query_id, requests = stats.requests, "Query timed out");
        Some(PoolState::QueryTimeout { query_id, stats })
    }
}
