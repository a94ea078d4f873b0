//! Iterative closest-nodes lookup state machine.
//!
//! A [`Query`] tracks a bounded shortlist of candidates ordered by XOR
//! distance to the target. Each call to [`Query::advance`] consumes at most
//! one event and returns one unit of work:
//!
//! 1. The closest unqueried candidate is sent a request, as long as fewer than
//!    `concurrency` requests are outstanding.
//! 2. A successful response marks the node queried and merges the nodes it
//!    returned into the shortlist.
//! 3. A failed or timed-out request marks the node unreachable. It is never
//!    contacted again and is skipped by the convergence check.
//!
//! The query finishes once the `num_results` closest reachable candidates
//! have all been queried, or when nothing is left to query and no request is
//! outstanding.
//!
//! A node's status only moves forward:
//! `Unqueried -> Waiting -> Queried | Unreachable`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::QueryConfig;
use crate::key::{Distance, Key, NodeId};

/// Caller-assigned identifier of a query, unique among live queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a candidate in the shortlist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    /// Not contacted yet.
    Unqueried,
    /// A request was sent at the given instant and is outstanding.
    Waiting(Instant),
    /// The node responded.
    Queried,
    /// The request failed or timed out.
    Unreachable,
}

/// Counters describing the progress of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryStats {
    /// When the query started running.
    pub start: Instant,
    /// When the query reached a terminal state.
    pub end: Option<Instant>,
    /// Number of requests sent.
    pub requests: usize,
    /// Number of successful responses.
    pub success: usize,
    /// Number of failed or timed-out requests.
    pub failure: usize,
}

impl QueryStats {
    fn new(start: Instant) -> Self {
        Self {
            start,
            end: None,
            requests: 0,
            success: 0,
            failure: 0,
        }
    }

    /// Wall-clock time between start and end, once the query has ended.
    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end.duration_since(self.start))
    }
}

/// Input to [`Query::advance`].
#[derive(Clone, Debug)]
pub enum QueryEvent<N> {
    /// No new information; report the next unit of work.
    Poll,
    /// `node` answered with nodes closer to the target.
    FindCloserResponse {
        /// The responding node.
        node: N,
        /// Nodes returned by the responder.
        closer: Vec<N>,
    },
    /// The request to `node` failed.
    FindCloserFailure {
        /// The node that failed.
        node: N,
        /// Transport-level description of the failure.
        error: String,
    },
}

/// Output of [`Query::advance`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryState<N> {
    /// Send a find-closer request to `node`.
    FindCloser {
        /// Destination of the request.
        node: N,
    },
    /// `concurrency` requests are outstanding.
    WaitingAtCapacity,
    /// Requests are outstanding but there is no candidate left to contact.
    WaitingWithCapacity,
    /// The lookup converged or ran out of candidates.
    Finished,
}

#[derive(Clone, Debug)]
struct Candidate<N> {
    node: N,
    distance: Distance,
    status: NodeStatus,
}

/// A single iterative lookup.
pub struct Query<N: NodeId> {
    id: QueryId,
    local: N,
    target: Key,
    /// Sorted by ascending distance to `target`, at most `max_shortlist` long.
    shortlist: Vec<Candidate<N>>,
    /// Number of candidates in `Waiting`.
    in_flight: usize,
    config: QueryConfig,
    stats: QueryStats,
    finished: bool,
}

impl<N: NodeId> Query<N> {
    /// Create a query for `target` seeded with `seeds`.
    ///
    /// `local` is never added to the shortlist.
    pub fn new(
        id: QueryId,
        local: N,
        target: Key,
        seeds: Vec<N>,
        config: QueryConfig,
        now: Instant,
    ) -> Self {
        let mut query = Self {
            id,
            local,
            target,
            shortlist: Vec::with_capacity(config.max_shortlist),
            in_flight: 0,
            config,
            stats: QueryStats::new(now),
            finished: false,
        };
        query.merge(seeds);
        query
    }

    /// The query's identifier.
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// The key being looked up.
    pub fn target(&self) -> &Key {
        &self.target
    }

    /// Progress counters.
    pub fn stats(&self) -> &QueryStats {
        &self.stats
    }

    /// Number of outstanding requests.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Whether the query has reached its terminal state.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Shortlist entries in ascending distance order.
    pub fn candidates(&self) -> impl Iterator<Item = (&N, NodeStatus)> {
        self.shortlist.iter().map(|c| (&c.node, c.status))
    }

    /// Status of `node`, if it is in the shortlist.
    pub fn status_of(&self, node: &N) -> Option<NodeStatus> {
        self.shortlist
            .iter()
            .find(|c| c.node == *node)
            .map(|c| c.status)
    }

    /// Up to `num_results` queried nodes closest to the target.
    pub fn closest_nodes(&self) -> Vec<N> {
        self.shortlist
            .iter()
            .filter(|c| c.status == NodeStatus::Queried)
            .take(self.config.num_results)
            .map(|c| c.node.clone())
            .collect()
    }

    /// Apply `event` and return the next unit of work.
    pub fn advance(&mut self, event: QueryEvent<N>, now: Instant) -> QueryState<N> {
        if self.finished {
            return QueryState::Finished;
        }

        match event {
            QueryEvent::Poll => {}
            QueryEvent::FindCloserResponse { node, closer } => self.on_response(&node, closer),
            QueryEvent::FindCloserFailure { node, error } => self.on_failure(&node, &error),
        }

        self.expire_requests(now);

        if self.is_converged() {
            self.finished = true;
            self.stats.end = Some(now);
            debug!(
                query_id = %self.id,
                requests = self.stats.requests,
                success = self.stats.success,
                failure = self.stats.failure,
                "Query finished"
            );
            return QueryState::Finished;
        }

        if self.in_flight >= self.config.concurrency {
            return QueryState::WaitingAtCapacity;
        }

        let next = self
            .shortlist
            .iter_mut()
            .find(|c| c.status == NodeStatus::Unqueried);
        match next {
            Some(candidate) => {
                candidate.status = NodeStatus::Waiting(now);
                self.in_flight += 1;
                self.stats.requests += 1;
                trace!(query_id = %self.id, node = ?candidate.node, "Selecting candidate");
                QueryState::FindCloser {
                    node: candidate.node.clone(),
                }
            }
            None => QueryState::WaitingWithCapacity,
        }
    }

    fn waiting_index(&self, node: &N) -> Option<usize> {
        self.shortlist
            .iter()
            .position(|c| c.node == *node && matches!(c.status, NodeStatus::Waiting(_)))
    }

    fn on_response(&mut self, node: &N, closer: Vec<N>) {
        let Some(idx) = self.waiting_index(node) else {
            debug!(query_id = %self.id, node = ?node, "Ignoring response from untracked node");
            return;
        };
        self.shortlist[idx].status = NodeStatus::Queried;
        self.in_flight -= 1;
        self.stats.success += 1;
        self.merge(closer);
    }

    fn on_failure(&mut self, node: &N, error: &str) {
        let Some(idx) = self.waiting_index(node) else {
            debug!(query_id = %self.id, node = ?node, "Ignoring failure from untracked node");
            return;
        };
        debug!(query_id = %self.id, node = ?node, error, "Node unreachable");
        self.shortlist[idx].status = NodeStatus::Unreachable;
        self.in_flight -= 1;
        self.stats.failure += 1;
    }

    fn expire_requests(&mut self, now: Instant) {
        let timeout = self.config.request_timeout();
        for candidate in &mut self.shortlist {
            if let NodeStatus::Waiting(since) = candidate.status {
                if now.saturating_duration_since(since) >= timeout {
                    debug!(query_id = %self.id, node = ?candidate.node, "Request timed out");
                    candidate.status = NodeStatus::Unreachable;
                    self.in_flight -= 1;
                    self.stats.failure += 1;
                }
            }
        }
    }

    /// Add unseen nodes as unqueried, re-sort and trim to the shortlist cap.
    fn merge(&mut self, nodes: Vec<N>) {
        for node in nodes {
            if node == self.local || self.shortlist.iter().any(|c| c.node == node) {
                continue;
            }
            let distance = node.key().distance(&self.target);
            self.shortlist.push(Candidate {
                node,
                distance,
                status: NodeStatus::Unqueried,
            });
        }

        // Stable sort: equidistant candidates keep arrival order.
        self.shortlist.sort_by(|a, b| a.distance.cmp(&b.distance));

        if self.shortlist.len() > self.config.max_shortlist {
            let evicted = self.shortlist.split_off(self.config.max_shortlist);
            let released = evicted
                .iter()
                .filter(|c| matches!(c.status, NodeStatus::Waiting(_)))
                .count();
            self.in_flight -= released;
        }
    }

    /// True when the `num_results` closest reachable candidates are all
    /// queried, or when every candidate is settled.
    fn is_converged(&self) -> bool {
        let mut settled = 0;
        for candidate in &self.shortlist {
            match candidate.status {
                NodeStatus::Unreachable => {}
                NodeStatus::Queried => {
                    settled += 1;
                    if settled >= self.config.num_results {
                        return true;
                    }
                }
                NodeStatus::Unqueried | NodeStatus::Waiting(_) => return false,
            }
        }
        true
    }
}

impl<N: NodeId> fmt::Debug for Query<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("shortlist", &self.shortlist.len())
            .field("in_flight", &self.in_flight)
            .field("finished", &self.finished)
            .finish()
    }
}
