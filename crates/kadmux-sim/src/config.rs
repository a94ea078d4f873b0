//! Simulator configuration.

use std::path::PathBuf;

use anyhow::{bail, Context};
use kadmux_query::PoolConfig;
use serde::{Deserialize, Serialize};

/// Environment variable naming the TOML configuration file.
pub const CONFIG_ENV: &str = "KADMUX_SIM_CONFIG";

/// Largest network the simulator can address, one `10.x.y.1` endpoint per peer.
pub const MAX_NODES: usize = 1 << 16;

/// Complete simulator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimConfig {
    /// Query pool settings.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Simulated network settings.
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Shape and behaviour of the in-memory network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Number of simulated peers.
    #[serde(default = "default_nodes")]
    pub nodes: usize,
    /// Number of lookups to run.
    #[serde(default = "default_queries")]
    pub queries: usize,
    /// Peers each simulated node knows about.
    #[serde(default = "default_table_size")]
    pub table_size: usize,
    /// Peers handed to each lookup as its starting candidates.
    #[serde(default = "default_bootstrap_peers")]
    pub bootstrap_peers: usize,
    /// Probability that a request fails, in `[0, 1]`.
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,
    /// Upper bound on simulated response latency.
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    /// Interval at which the driver polls for expired requests and queries.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_nodes() -> usize {
    200
}

fn default_queries() -> usize {
    16
}

fn default_table_size() -> usize {
    20
}

fn default_bootstrap_peers() -> usize {
    8
}

fn default_failure_rate() -> f64 {
    0.05
}

fn default_max_latency_ms() -> u64 {
    50
}

fn default_tick_ms() -> u64 {
    500
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            queries: default_queries(),
            table_size: default_table_size(),
            bootstrap_peers: default_bootstrap_peers(),
            failure_rate: default_failure_rate(),
            max_latency_ms: default_max_latency_ms(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl NetworkConfig {
    /// Validate the network settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.nodes == 0 || self.nodes > MAX_NODES {
            bail!("network.nodes must be within [1, {MAX_NODES}], got {}", self.nodes);
        }
        if self.table_size == 0 || self.bootstrap_peers == 0 {
            bail!("network.table_size and network.bootstrap_peers must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            bail!("network.failure_rate must be within [0, 1], got {}", self.failure_rate);
        }
        if self.tick_ms == 0 {
            bail!("network.tick_ms must be at least 1");
        }
        Ok(())
    }
}

impl SimConfig {
    /// Load configuration from the file named by [`CONFIG_ENV`].
    ///
    /// Falls back to defaults if the variable is unset.
    pub fn load() -> anyhow::Result<Self> {
        let config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(PathBuf::from(path))?,
            Err(_) => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Validate pool and network settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.pool.validate().context("invalid [pool] section")?;
        self.network.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SimConfig::default();
        assert_eq!(config.network.nodes, 200);
        assert_eq!(config.pool.concurrency, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SimConfig = toml::from_str(
            r#"
            [pool]
            concurrency = 8

            [network]
            failure_rate = 0.5
            "#,
        )
        .expect("valid toml");
        assert_eq!(config.pool.concurrency, 8);
        assert_eq!(config.pool.replication, 20);
        assert_eq!(config.network.failure_rate, 0.5);
        assert_eq!(config.network.queries, 16);
    }

    #[test]
    fn test_validate_bounds_node_count() {
        let mut config = SimConfig::default();
        config.network.nodes = MAX_NODES;
        assert!(config.validate().is_ok());

        config.network.nodes = MAX_NODES + 1;
        let err = config.validate().expect_err("too many nodes");
        assert!(err.to_string().contains("network.nodes"));

        config.network.nodes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_failure_rate() {
        let mut config = SimConfig::default();
        config.network.failure_rate = 1.5;
        assert!(config.validate().is_err());
    }
}
