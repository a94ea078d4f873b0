//! Query and pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    QueryError, Result, ALPHA, K, POOL_CONCURRENCY, QUERY_TIMEOUT_SECS, REQUEST_TIMEOUT_SECS,
};

/// Configuration for a single iterative lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Maximum outstanding requests for this query (alpha).
    #[serde(default = "default_query_concurrency")]
    pub concurrency: usize,
    /// Number of closest nodes that must be settled before the query
    /// converges (k).
    #[serde(default = "default_replication")]
    pub num_results: usize,
    /// Seconds a request may stay outstanding before its node is marked
    /// unreachable.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum number of candidates kept in the shortlist.
    #[serde(default = "default_max_shortlist")]
    pub max_shortlist: usize,
}

/// Configuration for a [`Pool`](crate::Pool).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of queries serviced at once.
    #[serde(default = "default_pool_concurrency")]
    pub concurrency: usize,
    /// Maximum number of queries waiting for a free slot.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Seconds a query may run before it is abandoned.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Number of closest nodes a query must settle (k).
    #[serde(default = "default_replication")]
    pub replication: usize,
    /// Maximum outstanding requests per query (alpha).
    #[serde(default = "default_query_concurrency")]
    pub query_concurrency: usize,
    /// Seconds a single request may stay outstanding.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum number of candidates kept in each query's shortlist.
    #[serde(default = "default_max_shortlist")]
    pub max_shortlist: usize,
}

fn default_query_concurrency() -> usize {
    ALPHA
}

fn default_replication() -> usize {
    K
}

fn default_request_timeout_secs() -> u64 {
    REQUEST_TIMEOUT_SECS
}

fn default_max_shortlist() -> usize {
    K * 3
}

fn default_pool_concurrency() -> usize {
    POOL_CONCURRENCY
}

fn default_max_pending() -> usize {
    1024
}

fn default_timeout_secs() -> u64 {
    QUERY_TIMEOUT_SECS
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            concurrency: default_query_concurrency(),
            num_results: default_replication(),
            request_timeout_secs: default_request_timeout_secs(),
            max_shortlist: default_max_shortlist(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_pool_concurrency(),
            max_pending: default_max_pending(),
            timeout_secs: default_timeout_secs(),
            replication: default_replication(),
            query_concurrency: default_query_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
            max_shortlist: default_max_shortlist(),
        }
    }
}

impl QueryConfig {
    /// Validate the query configuration.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(QueryError::InvalidConfig(
                "query concurrency must be at least 1".to_string(),
            ));
        }
        if self.num_results == 0 {
            return Err(QueryError::InvalidConfig(
                "num_results must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(QueryError::InvalidConfig(
                "request_timeout_secs must be non-zero".to_string(),
            ));
        }
        if self.max_shortlist < self.num_results {
            return Err(QueryError::InvalidConfig(format!(
                "max_shortlist ({}) is smaller than num_results ({})",
                self.max_shortlist, self.num_results,
            )));
        }
        Ok(())
    }

    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl PoolConfig {
    /// Validate the pool configuration, including the per-query settings it
    /// hands to every query.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(QueryError::InvalidConfig(
                "pool concurrency must be at least 1".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(QueryError::InvalidConfig(
                "timeout_secs must be non-zero".to_string(),
            ));
        }
        self.query_config().validate()
    }

    /// Query timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The configuration given to each query admitted by the pool.
    pub fn query_config(&self) -> QueryConfig {
        QueryConfig {
            concurrency: self.query_concurrency,
            num_results: self.replication,
            request_timeout_secs: self.request_timeout_secs,
            max_shortlist: self.max_shortlist,
        }
    }
}
