//! Events exchanged with the coordination event loop and with waiters.

use kadmux_query::{CloserNodesResponse, FindCloserRequest, Key, QueryId, QueryStats};

use crate::identity::{AddrInfo, PeerId};
use crate::notify::{NotifyHandle, Waiter};

/// Events accepted or produced by [`PooledQueryBehaviour`](crate::PooledQueryBehaviour).
///
/// The first four variants are inbound and handled by `notify`. The last two
/// are outbound and returned by `perform`.
#[derive(Debug)]
pub enum BehaviourEvent {
    /// Start a lookup for `target`.
    StartQuery {
        query_id: QueryId,
        target: Key,
        request: FindCloserRequest,
        /// Closest peers known locally, used as the initial candidates.
        known_closest: Vec<PeerId>,
        /// Recipient of progress and completion events, if any.
        notify: Option<Waiter>,
    },
    /// Abandon a lookup.
    StopQuery { query_id: QueryId },
    /// A peer answered a find-closer request.
    GetCloserNodesSuccess {
        query_id: QueryId,
        to: AddrInfo,
        target: Key,
        closer_nodes: Vec<AddrInfo>,
    },
    /// A find-closer request failed.
    GetCloserNodesFailure {
        query_id: QueryId,
        to: AddrInfo,
        target: Key,
        error: String,
    },
    /// Send a find-closer request for `target` to `to` and report the outcome
    /// through `notify`.
    OutboundGetCloserNodes {
        query_id: QueryId,
        to: AddrInfo,
        target: Key,
        notify: NotifyHandle,
    },
    /// A peer was discovered; record it in the address book.
    AddAddrInfo { info: AddrInfo },
}

impl BehaviourEvent {
    /// Variant name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            BehaviourEvent::StartQuery { .. } => "StartQuery",
            BehaviourEvent::StopQuery { .. } => "StopQuery",
            BehaviourEvent::GetCloserNodesSuccess { .. } => "GetCloserNodesSuccess",
            BehaviourEvent::GetCloserNodesFailure { .. } => "GetCloserNodesFailure",
            BehaviourEvent::OutboundGetCloserNodes { .. } => "OutboundGetCloserNodes",
            BehaviourEvent::AddAddrInfo { .. } => "AddAddrInfo",
        }
    }
}

/// Events delivered to a query's [`Waiter`].
///
/// A waiter sees zero or more `Progressed` events followed by exactly one
/// `Finished` or `TimedOut`, unless the query is stopped first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaiterEvent {
    /// A peer answered on behalf of the query.
    Progressed {
        query_id: QueryId,
        node_id: PeerId,
        response: CloserNodesResponse<PeerId>,
    },
    /// The query converged.
    Finished {
        query_id: QueryId,
        stats: QueryStats,
        /// Closest peers that responded, nearest first.
        closest: Vec<PeerId>,
    },
    /// The query ran past its time budget.
    TimedOut { query_id: QueryId, stats: QueryStats },
}

impl WaiterEvent {
    /// The query this event belongs to.
    pub fn query_id(&self) -> QueryId {
        match self {
            WaiterEvent::Progressed { query_id, .. }
            | WaiterEvent::Finished { query_id, .. }
            | WaiterEvent::TimedOut { query_id, .. } => *query_id,
        }
    }

    /// Whether no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WaiterEvent::Finished { .. } | WaiterEvent::TimedOut { .. }
        )
    }
}
