// src/core/supervisor.rs

//! The process-wide cluster registry and the config reload loop.
//!
//! The registry is a fixed array of append-only slots: a slot below
//! `cluster_count` is set exactly once and never reassigned, which keeps the
//! hot-path lookup lock-free. Clusters are never removed; a reload that drops
//! a name is refused wholesale.

use crate::config::{ClusterConfig, Config, ProxyConfig, diff_cluster_configs, removed_names};
use crate::core::cluster::{Cluster, next_sn};
use crate::core::forwarder::ForwarderHandle;
use crate::core::{CitrineError, metrics};
use crate::server::listener::AnyListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Fixed capacity of the cluster registry.
pub const MAX_CLUSTERS: usize = 128;

/// Event counters for the reload and admission surfaces. Each bump is
/// mirrored into the corresponding Prometheus metric.
#[derive(Default)]
pub struct SupervisorStats {
    cluster_changes: AtomicU64,
    cluster_change_failures: AtomicU64,
    add_cluster_failures: AtomicU64,
    load_failures: AtomicU64,
    rejected_removals: AtomicU64,
    connections_received: AtomicU64,
    connections_rejected: AtomicU64,
}

impl SupervisorStats {
    /// Counts an applied cluster config change.
    pub fn incr_cluster_changes(&self) {
        self.cluster_changes.fetch_add(1, Ordering::Relaxed);
        metrics::CLUSTER_CHANGES_TOTAL.inc();
    }

    pub fn cluster_changes(&self) -> u64 {
        self.cluster_changes.load(Ordering::Relaxed)
    }

    /// Counts a cluster config change that failed to apply.
    pub fn incr_cluster_change_failures(&self) {
        self.cluster_change_failures.fetch_add(1, Ordering::Relaxed);
        metrics::CLUSTER_CHANGE_FAILURES_TOTAL.inc();
    }

    pub fn cluster_change_failures(&self) -> u64 {
        self.cluster_change_failures.load(Ordering::Relaxed)
    }

    /// Counts a cluster addition that failed during reload.
    pub fn incr_add_cluster_failures(&self) {
        self.add_cluster_failures.fetch_add(1, Ordering::Relaxed);
        metrics::ADD_CLUSTER_FAILURES_TOTAL.inc();
    }

    pub fn add_cluster_failures(&self) -> u64 {
        self.add_cluster_failures.load(Ordering::Relaxed)
    }

    /// Counts a reload skipped for a load/parse failure or registry overflow.
    pub fn incr_load_failures(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
        metrics::CONFIG_LOAD_FAILURES_TOTAL.inc();
    }

    pub fn load_failures(&self) -> u64 {
        self.load_failures.load(Ordering::Relaxed)
    }

    /// Counts a reload refused for attempting cluster removal.
    pub fn incr_rejected_removals(&self) {
        self.rejected_removals.fetch_add(1, Ordering::Relaxed);
        metrics::REJECTED_REMOVALS_TOTAL.inc();
    }

    pub fn rejected_removals(&self) -> u64 {
        self.rejected_removals.load(Ordering::Relaxed)
    }

    /// Counts an accepted client connection.
    pub fn incr_connections_received(&self) {
        self.connections_received.fetch_add(1, Ordering::Relaxed);
        metrics::CONNECTIONS_RECEIVED_TOTAL.inc();
    }

    pub fn connections_received(&self) -> u64 {
        self.connections_received.load(Ordering::Relaxed)
    }

    /// Counts a connection rejected by the admission cap.
    pub fn incr_connections_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::CONNECTIONS_REJECTED_TOTAL.inc();
    }

    pub fn connections_rejected(&self) -> u64 {
        self.connections_rejected.load(Ordering::Relaxed)
    }
}

pub struct Supervisor {
    /// Self-handle so `&self` methods can hand owned references to the tasks
    /// they spawn. Always upgradable while any strong reference exists.
    me: Weak<Supervisor>,
    clusters: Vec<OnceLock<Arc<Cluster>>>,
    cluster_count: AtomicUsize,
    conns: AtomicU64,
    max_connections: u64,
    config_path: PathBuf,
    monitor_interval: Duration,
    closed: AtomicBool,
    started: AtomicBool,
    /// Serializes registry expansion only; never touched on the hot path.
    registry_lock: tokio::sync::Mutex<()>,
    pub stats: SupervisorStats,
    shutdown_tx: broadcast::Sender<()>,
}

impl Supervisor {
    pub fn new(proxy: &ProxyConfig, config_path: impl Into<PathBuf>) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let config_path = config_path.into();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            clusters: (0..MAX_CLUSTERS).map(|_| OnceLock::new()).collect(),
            cluster_count: AtomicUsize::new(0),
            conns: AtomicU64::new(0),
            max_connections: proxy.max_connections,
            config_path,
            monitor_interval: proxy.monitor_interval,
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            registry_lock: tokio::sync::Mutex::new(()),
            stats: SupervisorStats::default(),
            shutdown_tx,
        })
    }

    fn arc(&self) -> Arc<Supervisor> {
        self.me.upgrade().expect("supervisor outlives its tasks")
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn max_connections(&self) -> u64 {
        self.max_connections
    }

    pub fn cluster_count(&self) -> usize {
        self.cluster_count.load(Ordering::Acquire)
    }

    pub fn cluster(&self, id: usize) -> Option<Arc<Cluster>> {
        if id >= self.cluster_count() {
            return None;
        }
        self.clusters[id].get().cloned()
    }

    pub fn cluster_by_name(&self, name: &str) -> Option<Arc<Cluster>> {
        self.all_clusters().into_iter().find(|c| c.name() == name)
    }

    pub fn all_clusters(&self) -> Vec<Arc<Cluster>> {
        (0..self.cluster_count())
            .filter_map(|id| self.clusters[id].get().cloned())
            .collect()
    }

    fn snapshot_confs(&self) -> Vec<ClusterConfig> {
        self.all_clusters()
            .iter()
            .map(|c| (*c.conf()).clone())
            .collect()
    }

    /// A shutdown receiver for tasks tied to the supervisor's lifetime.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    // --- process-wide connection accounting ---

    pub fn conn_count(&self) -> u64 {
        self.conns.load(Ordering::Acquire)
    }

    /// Counts a freshly accepted connection and returns the new total.
    pub fn conn_admitted(&self) -> u64 {
        let count = self.conns.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::CONNECTED_CLIENTS.set(count as f64);
        count
    }

    pub fn conn_released(&self) {
        let count = self.conns.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::CONNECTED_CLIENTS.set(count as f64);
    }

    /// Brings up the initial cluster set and starts the config watch loop.
    /// Init-once: a second call is a logged no-op. Any bring-up failure here
    /// is fatal and aborts startup.
    pub async fn serve(&self, initial: Vec<ClusterConfig>) -> Result<(), CitrineError> {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("Supervisor::serve called twice; ignoring");
            return Ok(());
        }
        for conf in initial {
            let name = conf.name.clone();
            self.add_cluster(conf).await.inspect_err(|e| {
                error!("fatal: failed to bring up cluster '{name}': {e}");
            })?;
        }
        let monitor = self.arc();
        let shutdown_rx = self.subscribe_shutdown();
        tokio::spawn(async move {
            monitor.monitor_conf_change(shutdown_rx).await;
        });
        Ok(())
    }

    /// Registers a new cluster in the next free slot, binds its listener, and
    /// spawns its accept loop. On failure nothing is installed: the slot
    /// stays empty and `cluster_count` is unchanged.
    pub async fn add_cluster(&self, mut conf: ClusterConfig) -> Result<Arc<Cluster>, CitrineError> {
        if self.is_closed() {
            return Err(CitrineError::ClusterClosed);
        }
        conf.sn = next_sn();

        let _guard = self.registry_lock.lock().await;
        let id = self.cluster_count.load(Ordering::Acquire);
        if id >= MAX_CLUSTERS {
            return Err(CitrineError::TooManyClusters(MAX_CLUSTERS));
        }
        conf.id = id;

        let forwarder = ForwarderHandle::new(&conf)?;
        let listener = AnyListener::bind(conf.listen_proto, &conf.listen_addr).await?;
        let bound_addr = listener.local_addr();

        info!(
            "cluster '{}' (id {}, sn {}) listening on {} -> {} backends ({})",
            conf.name,
            id,
            conf.sn,
            bound_addr,
            conf.servers.len(),
            conf.cache_type
        );

        let cluster = Arc::new(Cluster::new(conf, forwarder, bound_addr));
        self.clusters[id]
            .set(cluster.clone())
            .map_err(|_| CitrineError::Internal(format!("registry slot {id} already occupied")))?;
        self.cluster_count.store(id + 1, Ordering::Release);
        metrics::CLUSTER_COUNT.set((id + 1) as f64);

        let sup = self.arc();
        let accept_cluster = cluster.clone();
        let shutdown_rx = self.subscribe_shutdown();
        tokio::spawn(async move {
            crate::server::accept_loop::run(sup, accept_cluster, listener, shutdown_rx).await;
        });

        Ok(cluster)
    }

    /// One reload step: classify the new cluster set against the installed
    /// one and apply the result. Refusals and per-cluster failures land in
    /// counters; traffic is never disturbed by a refused reload.
    pub async fn apply_cluster_configs(&self, new: Vec<ClusterConfig>) {
        let old = self.snapshot_confs();

        let removed = removed_names(&new, &old);
        if !removed.is_empty() {
            warn!(
                "config reload refused: cluster removal is not supported (missing: {})",
                removed.join(", ")
            );
            self.stats.incr_rejected_removals();
            return;
        }

        let (changed, added) = diff_cluster_configs(&new, &old);
        if self.cluster_count() + added.len() > MAX_CLUSTERS {
            warn!(
                "config reload refused: {} clusters would exceed the registry capacity of {}",
                self.cluster_count() + added.len(),
                MAX_CLUSTERS
            );
            self.stats.incr_load_failures();
            return;
        }

        for conf in changed {
            let Some(cluster) = self.cluster_by_name(&conf.name) else {
                continue;
            };
            match cluster.process_conf_change(conf) {
                Ok(()) => {
                    info!(
                        "cluster '{}' reconfigured at generation {}",
                        cluster.name(),
                        cluster.conf().sn
                    );
                    self.stats.incr_cluster_changes();
                }
                Err(e) => {
                    warn!(
                        "cluster '{}' kept its previous config: {}",
                        cluster.name(),
                        e
                    );
                    self.stats.incr_cluster_change_failures();
                }
            }
        }

        for conf in added {
            let name = conf.name.clone();
            if let Err(e) = self.add_cluster(conf).await {
                warn!("failed to add cluster '{name}' during reload: {e}");
                self.stats.incr_add_cluster_failures();
            }
        }
    }

    /// Re-reads the config file and applies its cluster set.
    pub async fn reload_from_file(&self) {
        let path = self.config_path.to_string_lossy().into_owned();
        let config = match Config::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("config reload skipped: {e:#}");
                self.stats.incr_load_failures();
                return;
            }
        };
        self.apply_cluster_configs(config.clusters).await;
    }

    /// The config watch loop: polls the config file at `monitor_interval`
    /// until shutdown.
    async fn monitor_conf_change(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "config watch started on {} (every {:?})",
            self.config_path.display(),
            self.monitor_interval
        );
        let mut interval = tokio::time::interval(self.monitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately and would re-apply the configs we
        // just brought up; harmless, but skip it for a quiet start.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reload_from_file().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("config watch shutting down");
                    return;
                }
            }
        }
    }

    /// Terminal shutdown: stops accept loops and the watch loop, closes every
    /// cluster and its connections.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("supervisor shutting down");
        let _ = self.shutdown_tx.send(());
        for cluster in self.all_clusters() {
            cluster.close();
        }
    }
}
