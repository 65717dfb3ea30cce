// src/config.rs

//! Manages proxy configuration: loading, validation, and the reload differ.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tracing::warn;

/// Protocol spoken by the clients of a cluster, and by its backends.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CacheType {
    #[default]
    Memcache,
    MemcacheBinary,
    Redis,
    RedisCluster,
}

/// Transport the cluster listener binds.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ListenProto {
    #[default]
    Tcp,
    Unix,
}

/// Key-hashing function used to place keys on the backend ring.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HashMethod {
    #[default]
    Fnv1a64,
    Crc16,
    Murmur3,
}

/// How hashed keys are distributed over the backend set.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HashDistribution {
    #[default]
    Ketama,
    Modula,
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8879
}

/// Process-wide settings from the `[proxy]` table.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProxyConfig {
    /// Process-wide cap on concurrent client connections. `0` disables the cap.
    #[serde(default)]
    pub max_connections: u64,
    /// How often the config file is polled for cluster changes.
    #[serde(with = "humantime_serde", default = "default_monitor_interval")]
    pub monitor_interval: Duration,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_connections: 0,
            monitor_interval: default_monitor_interval(),
            log_level: default_log_level(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// One `[[clusters]]` record: a listener plus its backing pool.
///
/// `id` and `sn` are never read from the file. `id` is the dense registry
/// index assigned when the cluster is first seen and kept for the process
/// lifetime; `sn` is the generation stamp reassigned on every create or
/// change.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(skip)]
    pub id: usize,
    #[serde(skip)]
    pub sn: u64,
    #[serde(default)]
    pub listen_proto: ListenProto,
    pub listen_addr: String,
    #[serde(default)]
    pub cache_type: CacheType,
    #[serde(default)]
    pub hash_method: HashMethod,
    #[serde(default)]
    pub hash_distribution: HashDistribution,
    /// Two-character tag delimiting the hashed portion of a key, e.g. `"{}"`.
    /// Empty disables tag extraction.
    #[serde(default)]
    pub hash_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_auth: Option<String>,
    #[serde(with = "humantime_serde", default = "default_dial_timeout")]
    pub dial_timeout: Duration,
    /// Per-read deadline on both client and backend sockets. Zero disables it.
    #[serde(with = "humantime_serde", default)]
    pub read_timeout: Duration,
    /// Per-write deadline on both client and backend sockets. Zero disables it.
    #[serde(with = "humantime_serde", default)]
    pub write_timeout: Duration,
    /// Idle backend connections pooled per node.
    #[serde(default = "default_node_connections")]
    pub node_connections: usize,
    /// Consecutive failures after which a node is considered down. `0` disables.
    #[serde(default)]
    pub ping_fail_limit: u32,
    /// If true, a node that hit `ping_fail_limit` is ejected from the ring
    /// until it answers again.
    #[serde(default)]
    pub ping_auto_eject: bool,
    /// If true, a config change forcibly closes the cluster's existing client
    /// connections.
    #[serde(default)]
    pub close_when_change: bool,
    pub servers: Vec<String>,
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_node_connections() -> usize {
    2
}

/// The parsed shape of the config file: a `[proxy]` table plus `[[clusters]]`.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the parsed configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            return Err(anyhow!("at least one [[clusters]] entry is required"));
        }
        for cluster in &self.clusters {
            cluster.validate()?;
        }
        let mut names: Vec<&str> = self.clusters.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.clusters.len() {
            return Err(anyhow!("cluster names must be unique"));
        }
        if self.proxy.monitor_interval.is_zero() {
            return Err(anyhow!("proxy.monitor_interval cannot be 0"));
        }
        if self.proxy.metrics.enabled && self.proxy.metrics.port == 0 {
            return Err(anyhow!("proxy.metrics.port cannot be 0"));
        }
        Ok(())
    }
}

impl ClusterConfig {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("cluster name cannot be empty"));
        }
        if self.listen_addr.trim().is_empty() {
            return Err(anyhow!("cluster '{}': listen_addr cannot be empty", self.name));
        }
        if self.servers.is_empty() {
            return Err(anyhow!("cluster '{}': servers cannot be empty", self.name));
        }
        if self.node_connections == 0 {
            return Err(anyhow!(
                "cluster '{}': node_connections cannot be 0",
                self.name
            ));
        }
        if !self.hash_tag.is_empty() && self.hash_tag.len() != 2 {
            return Err(anyhow!(
                "cluster '{}': hash_tag must be exactly two characters",
                self.name
            ));
        }
        Ok(())
    }

    /// The server list in a canonical order, for order-insensitive comparison.
    pub fn sorted_servers(&self) -> Vec<String> {
        let mut servers = self.servers.clone();
        servers.sort_unstable();
        servers
    }

    /// True if `other` differs in any forwarding-relevant field.
    ///
    /// `name`, `id`, `sn`, and `listen_addr` are deliberately excluded:
    /// identity fields never count as a change, and an address change is
    /// rejected upstream as invalid.
    fn differs_from(&self, other: &ClusterConfig) -> bool {
        self.cache_type != other.cache_type
            || self.listen_proto != other.listen_proto
            || self.hash_method != other.hash_method
            || self.hash_distribution != other.hash_distribution
            || self.hash_tag != other.hash_tag
            || self.redis_auth != other.redis_auth
            || self.dial_timeout != other.dial_timeout
            || self.read_timeout != other.read_timeout
            || self.write_timeout != other.write_timeout
            || self.node_connections != other.node_connections
            || self.ping_fail_limit != other.ping_fail_limit
            || self.ping_auto_eject != other.ping_auto_eject
            || self.close_when_change != other.close_when_change
            || self.sorted_servers() != other.sorted_servers()
    }
}

/// Compares new cluster configs against the currently installed ones and
/// classifies each new entry as changed, added, or unchanged.
///
/// Entries that attempt to change a cluster's `listen_addr` are invalid: the
/// listener cannot be rebound while its accept loop runs, so the entry is
/// warn-logged and dropped from both outputs. Changed entries carry the old
/// cluster's `id` forward. The result is deterministic regardless of the
/// order of either input.
pub fn diff_cluster_configs(
    new: &[ClusterConfig],
    old: &[ClusterConfig],
) -> (Vec<ClusterConfig>, Vec<ClusterConfig>) {
    let mut changed = Vec::new();
    let mut added = Vec::new();

    for next in new {
        let Some(current) = old.iter().find(|o| o.name == next.name) else {
            added.push(next.clone());
            continue;
        };
        if current.listen_addr != next.listen_addr {
            warn!(
                "cluster '{}': listen_addr cannot change ({} -> {}), dropping the entry from this reload",
                next.name, current.listen_addr, next.listen_addr
            );
            continue;
        }
        if !current.differs_from(next) {
            continue;
        }
        if current.cache_type != next.cache_type && !next.close_when_change {
            warn!(
                "cluster '{}': cache_type changes ({} -> {}) mis-serve already connected clients unless close_when_change is set",
                next.name, current.cache_type, next.cache_type
            );
        }
        let mut entry = next.clone();
        entry.id = current.id;
        changed.push(entry);
    }

    (changed, added)
}

/// Names present in `old` but missing from `new`. A non-empty result refuses
/// the whole reload, since cluster removal is not supported.
pub fn removed_names(new: &[ClusterConfig], old: &[ClusterConfig]) -> Vec<String> {
    old.iter()
        .filter(|o| !new.iter().any(|n| n.name == o.name))
        .map(|o| o.name.clone())
        .collect()
}
