// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pool registry: lazy, reconnecting client handles per target.
//!
//! One `PgPool` per (cloud, database), one cluster client per KV cloud.
//! Handles are created on first use and cached; a handle that keeps
//! failing is evicted so the next use rebuilds it from scratch, which keeps
//! one unreachable target from wedging unrelated ones.
//!
//! The registry is a process-global singleton in practice: it is built once
//! at startup and shared behind an `Arc`. All lazy initialisation goes
//! through `DashMap::entry`, so concurrent first use is safe.

use std::time::Duration;

use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::{debug, warn};

use crate::config::{CloudConfig, DatabaseConfig};
use crate::error::{CoreError, Result};

/// Pool sizing per (cloud, database).
const POOL_MIN: u32 = 2;
const POOL_MAX: u32 = 20;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive failures before a SQL pool handle is evicted.
const SQL_MAX_FAILURES: u32 = 5;
/// Consecutive failures before a cluster client handle is evicted.
const KV_MAX_FAILURES: u32 = 10;

/// Exponential reconnect delay: 500 ms base, doubling, capped at 30 s.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    /// The registry-wide reconnect policy.
    pub fn reconnect() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }

    /// Delay before the given 0-based retry attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let millis = self
            .base
            .as_millis()
            .saturating_mul(1u128 << attempt.min(16));
        Duration::from_millis(millis.min(self.cap.as_millis()) as u64)
    }
}

/// Log on the first error and every Nth thereafter.
#[derive(Debug, Default)]
pub struct ErrorThrottle {
    count: std::sync::atomic::AtomicU64,
}

impl ErrorThrottle {
    const EVERY: u64 = 10;

    /// Record an error; returns whether it should be logged.
    pub fn should_log(&self) -> bool {
        let n = self.count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        n % Self::EVERY == 0
    }

    /// Reset after a success so the next error logs immediately.
    pub fn reset(&self) {
        self.count.store(0, std::sync::atomic::Ordering::Relaxed);
    }
}

/// A master node of a KV cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterNode {
    /// Node host.
    pub host: String,
    /// Node client port.
    pub port: u16,
    /// Cluster node id.
    pub id: String,
}

/// Process-global registry of connection handles.
pub struct PoolRegistry {
    config: CloudConfig,
    sql_pools: DashMap<(String, String), PgPool>,
    sql_failures: DashMap<(String, String), u32>,
    kv_clients: DashMap<String, ClusterClient>,
    kv_failures: DashMap<String, u32>,
    throttle: ErrorThrottle,
    backoff: Backoff,
}

impl PoolRegistry {
    /// Build a registry over the declared topology. No I/O happens here;
    /// every handle is created lazily on first use.
    pub fn new(config: CloudConfig) -> Self {
        Self {
            config,
            sql_pools: DashMap::new(),
            sql_failures: DashMap::new(),
            kv_clients: DashMap::new(),
            kv_failures: DashMap::new(),
            throttle: ErrorThrottle::default(),
            backoff: Backoff::reconnect(),
        }
    }

    /// Snapshot of the declared topology for request validation.
    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    /// The lazy pool for (cloud, database). Fails if the pair is not
    /// declared in configuration.
    pub fn sql_pool(&self, cloud: &str, database: &str) -> Result<PgPool> {
        let cloud_config = self
            .config
            .sql_cloud(cloud)
            .ok_or_else(|| CoreError::UnknownCloud(cloud.to_string()))?;
        let db = cloud_config
            .database(database)
            .ok_or_else(|| CoreError::UnknownDatabase {
                cloud: cloud.to_string(),
                database: database.to_string(),
            })?;

        let key = (cloud.to_string(), database.to_string());
        let pool = self
            .sql_pools
            .entry(key)
            .or_insert_with(|| {
                debug!(cloud, database, "Building SQL pool");
                build_pool(db)
            })
            .clone();
        Ok(pool)
    }

    /// Note a failed acquisition on a SQL pool. After enough consecutive
    /// failures the handle is evicted and rebuilt on next use.
    pub fn note_sql_failure(&self, cloud: &str, database: &str) {
        let key = (cloud.to_string(), database.to_string());
        let mut failures = self.sql_failures.entry(key.clone()).or_insert(0);
        *failures += 1;
        if self.throttle.should_log() {
            warn!(cloud, database, failures = *failures, "SQL pool acquisition failed");
        }
        if *failures >= SQL_MAX_FAILURES {
            drop(failures);
            self.sql_failures.remove(&key);
            if self.sql_pools.remove(&key).is_some() {
                warn!(cloud, database, "Evicted SQL pool after repeated failures");
            }
        }
    }

    /// Note a successful acquisition, resetting the failure count.
    pub fn note_sql_success(&self, cloud: &str, database: &str) {
        self.sql_failures
            .remove(&(cloud.to_string(), database.to_string()));
        self.throttle.reset();
    }

    /// The lazy cluster client for a KV cloud.
    pub fn kv_client(&self, cloud: &str) -> Result<ClusterClient> {
        let kv = self
            .config
            .kv_cloud(cloud)
            .ok_or_else(|| CoreError::UnknownCloud(cloud.to_string()))?;
        if let Some(client) = self.kv_clients.get(cloud) {
            return Ok(client.clone());
        }
        let url = format!("redis://{}:{}/", kv.host, kv.port);
        let client = ClusterClient::new(vec![url])?;
        self.kv_clients.insert(cloud.to_string(), client.clone());
        Ok(client)
    }

    /// A cluster connection for a KV cloud, with failure-count eviction.
    pub async fn kv_connection(&self, cloud: &str) -> Result<ClusterConnection> {
        let client = self.kv_client(cloud)?;
        match tokio::time::timeout(CONNECT_TIMEOUT, client.get_async_connection()).await {
            Ok(Ok(conn)) => {
                self.kv_failures.remove(cloud);
                Ok(conn)
            }
            Ok(Err(e)) => {
                self.note_kv_failure(cloud);
                Err(e.into())
            }
            Err(_) => {
                self.note_kv_failure(cloud);
                Err(CoreError::Other(format!(
                    "timed out connecting to KV cloud '{}'",
                    cloud
                )))
            }
        }
    }

    fn note_kv_failure(&self, cloud: &str) {
        let mut failures = self.kv_failures.entry(cloud.to_string()).or_insert(0);
        *failures += 1;
        if self.throttle.should_log() {
            warn!(cloud, failures = *failures, "KV cluster connection failed");
        }
        if *failures >= KV_MAX_FAILURES {
            drop(failures);
            self.kv_failures.remove(cloud);
            if self.kv_clients.remove(cloud).is_some() {
                warn!(cloud, "Evicted KV cluster client after repeated failures");
            }
        }
    }

    /// Discover the master nodes of a KV cloud.
    ///
    /// Opens a short-lived seed connection (retrying with backoff) and asks
    /// the cluster for its topology, filtered to masters not flagged failed.
    /// Invoked at the start of each scan, so the view is current.
    pub async fn kv_masters(&self, cloud: &str) -> Result<Vec<MasterNode>> {
        let kv = self
            .config
            .kv_cloud(cloud)
            .ok_or_else(|| CoreError::UnknownCloud(cloud.to_string()))?;
        let url = format!("redis://{}:{}/", kv.host, kv.port);

        let mut last_err: Option<CoreError> = None;
        for attempt in 0..3u32 {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
            }
            match self.seed_topology(&url).await {
                Ok(raw) => return Ok(parse_cluster_nodes(&raw)),
                Err(e) => {
                    if self.throttle.should_log() {
                        warn!(cloud, attempt, error = %e, "Topology discovery failed");
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::Other("topology discovery failed".into())))
    }

    async fn seed_topology(&self, url: &str) -> Result<String> {
        let client = redis::Client::open(url)?;
        let mut conn: MultiplexedConnection =
            tokio::time::timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection())
                .await
                .map_err(|_| CoreError::Other("timed out connecting to cluster seed".into()))??;
        let raw: String = redis::cmd("CLUSTER")
            .arg("NODES")
            .query_async(&mut conn)
            .await?;
        Ok(raw)
    }

    /// A short-lived direct connection to one cluster node, for per-node
    /// SCAN iteration.
    pub async fn node_connection(&self, node: &MasterNode) -> Result<MultiplexedConnection> {
        let url = format!("redis://{}:{}/", node.host, node.port);
        let client = redis::Client::open(url.as_str())?;
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| {
                CoreError::Other(format!("timed out connecting to node {}:{}", node.host, node.port))
            })??;
        Ok(conn)
    }
}

fn build_pool(db: &DatabaseConfig) -> PgPool {
    let options = PgConnectOptions::new()
        .host(&db.host)
        .port(db.port)
        .username(&db.user)
        .password(&db.password)
        .database(&db.database);
    PgPoolOptions::new()
        .min_connections(POOL_MIN)
        .max_connections(POOL_MAX)
        .idle_timeout(POOL_IDLE_TIMEOUT)
        .acquire_timeout(CONNECT_TIMEOUT)
        .connect_lazy_with(options)
}

/// Parse `CLUSTER NODES` output into master nodes, skipping replicas and
/// nodes flagged failed.
fn parse_cluster_nodes(raw: &str) -> Vec<MasterNode> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            let addr = parts.next()?;
            let flags = parts.next()?;
            if !flags.split(',').any(|f| f == "master") {
                return None;
            }
            if flags.split(',').any(|f| f == "fail" || f == "fail?") {
                return None;
            }
            // addr is host:port@cluster-port
            let addr = addr.split('@').next()?;
            let (host, port) = addr.rsplit_once(':')?;
            Some(MasterNode {
                host: host.to_string(),
                port: port.parse().ok()?,
                id: id.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KvCloudConfig, SqlCloudConfig};

    fn test_config() -> CloudConfig {
        CloudConfig {
            primary: SqlCloudConfig {
                cloud_name: "atlas".into(),
                db_configs: vec![DatabaseConfig {
                    name: "mydb".into(),
                    host: "127.0.0.1".into(),
                    port: 5432,
                    user: "ops".into(),
                    password: "pw".into(),
                    database: "mydb".into(),
                    schemas: vec!["public".into()],
                    default_schema: "public".into(),
                }],
            },
            secondaries: vec![],
            kv_clouds: vec![KvCloudConfig {
                cloud_name: "cache".into(),
                host: "127.0.0.1".into(),
                port: 6379,
            }],
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff::reconnect();
        assert_eq!(backoff.delay(0), Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay(6), Duration::from_secs(30));
        assert_eq!(backoff.delay(20), Duration::from_secs(30));
    }

    #[test]
    fn test_error_throttle() {
        let throttle = ErrorThrottle::default();
        assert!(throttle.should_log());
        for _ in 0..ErrorThrottle::EVERY - 1 {
            assert!(!throttle.should_log());
        }
        assert!(throttle.should_log());
        throttle.reset();
        assert!(throttle.should_log());
    }

    #[test]
    fn test_sql_pool_unknown_pair() {
        let registry = PoolRegistry::new(test_config());
        assert!(matches!(
            registry.sql_pool("nowhere", "mydb"),
            Err(CoreError::UnknownCloud(_))
        ));
        assert!(matches!(
            registry.sql_pool("atlas", "otherdb"),
            Err(CoreError::UnknownDatabase { .. })
        ));
    }

    #[test]
    fn test_sql_pool_is_lazy_and_cached() {
        let registry = PoolRegistry::new(test_config());
        // connect_lazy: building the handle performs no I/O
        let _a = registry.sql_pool("atlas", "mydb").unwrap();
        let _b = registry.sql_pool("atlas", "mydb").unwrap();
        assert_eq!(registry.sql_pools.len(), 1);
    }

    #[test]
    fn test_sql_failure_eviction() {
        let registry = PoolRegistry::new(test_config());
        registry.sql_pool("atlas", "mydb").unwrap();
        assert_eq!(registry.sql_pools.len(), 1);
        for _ in 0..SQL_MAX_FAILURES {
            registry.note_sql_failure("atlas", "mydb");
        }
        assert_eq!(registry.sql_pools.len(), 0);
    }

    #[test]
    fn test_sql_success_resets_failures() {
        let registry = PoolRegistry::new(test_config());
        registry.sql_pool("atlas", "mydb").unwrap();
        for _ in 0..SQL_MAX_FAILURES - 1 {
            registry.note_sql_failure("atlas", "mydb");
        }
        registry.note_sql_success("atlas", "mydb");
        for _ in 0..SQL_MAX_FAILURES - 1 {
            registry.note_sql_failure("atlas", "mydb");
        }
        assert_eq!(registry.sql_pools.len(), 1);
    }

    #[test]
    fn test_parse_cluster_nodes() {
        let raw = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460
6ec23923021cf3ffec47632106199cb7f496ce01 127.0.0.1:30005@31005 master,fail - 1426238316232 1426238316232 5 connected
";
        let masters = parse_cluster_nodes(raw);
        assert_eq!(masters.len(), 2);
        assert_eq!(masters[0].port, 30002);
        assert_eq!(masters[1].port, 30001);
        assert!(masters.iter().all(|m| m.host == "127.0.0.1"));
    }

    #[test]
    fn test_kv_client_unknown_cloud() {
        let registry = PoolRegistry::new(test_config());
        assert!(matches!(
            registry.kv_client("nowhere"),
            Err(CoreError::UnknownCloud(_))
        ));
        assert!(registry.kv_client("cache").is_ok());
    }
}
