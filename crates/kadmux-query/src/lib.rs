//! # kadmux-query
//!
//! Iterative Kademlia lookups and the pool that schedules them.
//!
//! This crate implements:
//! - 256-bit keys with the XOR distance metric
//! - [`query::Query`], a pure state machine for one iterative closest-nodes lookup
//! - [`pool::Pool`], which runs many queries under a global limit on active
//!   queries and a per-query limit on outstanding requests
//!
//! Neither type performs I/O. Callers feed events in through `advance` and act
//! on the returned state, one unit of work at a time.
//!
//! ## Key Parameters
//!
//! | Parameter | Default |
//! |---|---|
//! | k (results / replication) | 20 |
//! | alpha (request parallelism per query) | 3 |
//! | Active queries per pool | 3 |
//! | Query timeout | 5 minutes |
//! | Request timeout | 1 minute |
//! | Shortlist cap | 3 * k |

pub mod config;
pub mod key;
pub mod pool;
pub mod query;

pub use config::{PoolConfig, QueryConfig};
pub use key::{Distance, Key, NodeId, NodeInfo, KEY_LEN};
pub use pool::{CloserNodesResponse, FindCloserRequest, Pool, PoolEvent, PoolState};
pub use query::{NodeStatus, Query, QueryEvent, QueryId, QueryState, QueryStats};

/// Number of closest nodes a lookup must settle before it converges.
pub const K: usize = 20;

/// Lookup parallelism factor.
pub const ALPHA: usize = 3;

/// Maximum number of queries a pool services at once.
pub const POOL_CONCURRENCY: usize = 3;

/// Wall-clock budget for a whole query in seconds (5 minutes).
pub const QUERY_TIMEOUT_SECS: u64 = 300;

/// Budget for a single outstanding request in seconds.
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Error types for query and pool construction.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A query with this id is already running or queued.
    #[error("duplicate query id {0}")]
    DuplicateQuery(QueryId),

    /// The pool is full and its waiting queue is at capacity.
    #[error("query queue full ({max} waiting)")]
    QueueFull { max: usize },
}

/// Convenience result type for query operations.
pub type Result<T> = std::result::Result<T, QueryError>;
