//! Slot directory: per-cluster topology snapshots and their lifecycle.
//!
//! A [`TopologySnapshot`] pairs the slot table with the flat server list
//! from the same `CLUSTER SLOTS` reply and is immutable once installed;
//! refresh swaps the whole `Arc` so concurrent readers never observe half a
//! topology. State is process-wide, keyed by cluster name, so every client
//! of the same cluster shares one directory.
//!
//! Callers must not hold a snapshot reference across I/O — clone the
//! `(ip, port, is_replica)` triple out of it first.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, warn};

use crate::cluster::store::{self, SharedDict};
use crate::config::ClusterConfig;
use crate::connection::pool::ConnectionPool;
use crate::connection::tcp::RedisConnection;
use crate::crc16::SLOT_COUNT;
use crate::error::{Error, Result};
use crate::resp::types::RespValue;

/// One node of a replica set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub ip: String,
    pub port: u16,
    pub is_replica: bool,
}

impl Server {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// A master and its replicas, covering one or more slot ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSet {
    servers: Vec<Server>,
}

impl ReplicaSet {
    fn from_nodes(nodes: &[RawNode]) -> Self {
        let servers = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| Server {
                ip: node.ip.clone(),
                port: node.port,
                is_replica: i > 0,
            })
            .collect();
        Self { servers }
    }

    /// The master node (index 0).
    pub fn master(&self) -> Option<&Server> {
        self.servers.first()
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Choose a node to send to.
    ///
    /// With replica reads disabled the master always wins. Otherwise a
    /// deterministic `seed` selects `seed % len` (the pipeline dispatcher
    /// uses one seed for a whole batch), and no seed means a uniform random
    /// index.
    pub fn pick(&self, enable_slave_read: bool, seed: Option<u64>) -> Result<(String, u16, bool)> {
        if self.servers.is_empty() {
            return Err(Error::Config("serv_list is empty".into()));
        }
        let index = if !enable_slave_read {
            0
        } else {
            match seed {
                Some(s) => (s % self.servers.len() as u64) as usize,
                None => rand::thread_rng().gen_range(0..self.servers.len()),
            }
        };
        let server = &self.servers[index];
        Ok((server.ip.clone(), server.port, server.is_replica))
    }
}

/// One node entry of a raw `CLUSTER SLOTS` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNode {
    pub ip: String,
    pub port: u16,
    pub id: Option<String>,
}

/// One `[start, end, master, replica…]` entry of a raw `CLUSTER SLOTS` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSlotRange {
    pub start: u16,
    pub end: u16,
    pub nodes: Vec<RawNode>,
}

/// Immutable pairing of slot table and server list from one topology query.
pub struct TopologySnapshot {
    slots: Vec<Option<Arc<ReplicaSet>>>,
    servers: Vec<Server>,
}

impl TopologySnapshot {
    pub fn from_ranges(ranges: &[RawSlotRange]) -> Self {
        let mut slots: Vec<Option<Arc<ReplicaSet>>> = vec![None; SLOT_COUNT as usize];
        let mut servers = Vec::new();
        for range in ranges {
            let set = Arc::new(ReplicaSet::from_nodes(&range.nodes));
            servers.extend_from_slice(set.servers());
            for slot in range.start..=range.end.min(SLOT_COUNT - 1) {
                slots[slot as usize] = Some(Arc::clone(&set));
            }
        }
        Self { slots, servers }
    }

    /// Replica set owning `slot`, if the topology covers it.
    pub fn replica_set(&self, slot: u16) -> Option<&Arc<ReplicaSet>> {
        self.slots.get(slot as usize).and_then(|s| s.as_ref())
    }

    /// Every server appearing in any replica set, duplicates permitted.
    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    /// Masters only, deduplicated by address.
    pub fn masters(&self) -> Vec<Server> {
        let mut seen = HashSet::new();
        self.servers
            .iter()
            .filter(|s| !s.is_replica && seen.insert(s.addr()))
            .cloned()
            .collect()
    }
}

/// Decode a `CLUSTER SLOTS` reply into raw ranges.
///
/// Malformed replica entries are skipped; a malformed master or an empty
/// reply is an error, since installing a topology without masters would
/// leave every request unroutable.
pub fn parse_cluster_slots(reply: &RespValue) -> Result<Vec<RawSlotRange>> {
    let entries = match reply {
        RespValue::Array(entries) => entries,
        other => {
            return Err(Error::Protocol(format!(
                "CLUSTER SLOTS: expected array, got {}",
                other.type_name()
            )))
        }
    };

    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        let items = match entry {
            RespValue::Array(items) if items.len() >= 3 => items,
            _ => continue,
        };
        let start = slot_number(&items[0])?;
        let end = slot_number(&items[1])?;

        let master = parse_node(&items[2])?;
        let mut nodes = vec![master];
        for item in &items[3..] {
            if let Ok(node) = parse_node(item) {
                nodes.push(node);
            }
        }
        ranges.push(RawSlotRange { start, end, nodes });
    }

    if ranges.is_empty() {
        return Err(Error::Protocol("CLUSTER SLOTS: no ranges in reply".into()));
    }
    Ok(ranges)
}

fn slot_number(value: &RespValue) -> Result<u16> {
    value
        .as_int()
        .filter(|&n| (0..SLOT_COUNT as i64).contains(&n))
        .map(|n| n as u16)
        .ok_or_else(|| Error::Protocol("CLUSTER SLOTS: invalid slot number".into()))
}

fn parse_node(value: &RespValue) -> Result<RawNode> {
    let items = match value {
        RespValue::Array(items) if items.len() >= 2 => items,
        _ => return Err(Error::Protocol("CLUSTER SLOTS: invalid node entry".into())),
    };
    let ip = items[0]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Protocol("CLUSTER SLOTS: invalid node ip".into()))?
        .to_string();
    let port = items[1]
        .as_int()
        .filter(|&p| (0..=u16::MAX as i64).contains(&p))
        .map(|p| p as u16)
        .ok_or_else(|| Error::Protocol("CLUSTER SLOTS: invalid node port".into()))?;
    let id = items.get(2).and_then(|v| v.as_str()).map(str::to_string);
    Ok(RawNode { ip, port, id })
}

static CLUSTERS: OnceLock<RwLock<HashMap<String, Arc<ClusterState>>>> = OnceLock::new();

/// Process-wide routing state for one named cluster.
pub struct ClusterState {
    config: Arc<ClusterConfig>,
    snapshot: RwLock<Option<Arc<TopologySnapshot>>>,
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
    /// Blocking: serializes first-time bootstrap.
    init_lock: Arc<tokio::sync::Mutex<()>>,
    /// Non-blocking: concurrent refreshers lose with `RefreshRace`.
    refresh_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ClusterState {
    /// Look up (or create) the state registered under the config's name.
    /// The first creation's config wins for the lifetime of the process.
    pub fn get_or_create(config: ClusterConfig) -> Arc<ClusterState> {
        let registry = CLUSTERS.get_or_init(|| RwLock::new(HashMap::new()));
        if let Some(state) = registry.read().get(&config.name) {
            return Arc::clone(state);
        }
        let mut registry = registry.write();
        Arc::clone(
            registry
                .entry(config.name.clone())
                .or_insert_with(|| Arc::new(ClusterState::new(config))),
        )
    }

    fn new(config: ClusterConfig) -> Self {
        let init_lock = store::named_lock(&format!(
            "{}:init:{}",
            config.lock_dict_name, config.name
        ));
        let refresh_lock = store::named_lock(&format!(
            "{}:{}:{}",
            config.lock_dict_name, config.refresh_lock_key, config.name
        ));
        Self {
            config: Arc::new(config),
            snapshot: RwLock::new(None),
            pools: RwLock::new(HashMap::new()),
            init_lock,
            refresh_lock,
        }
    }

    pub fn config(&self) -> &Arc<ClusterConfig> {
        &self.config
    }

    /// Current snapshot, if any. The returned `Arc` must be dropped before
    /// the caller suspends.
    pub fn snapshot(&self) -> Option<Arc<TopologySnapshot>> {
        self.snapshot.read().clone()
    }

    fn install(&self, snapshot: Arc<TopologySnapshot>) {
        *self.snapshot.write() = Some(snapshot);
    }

    /// Keepalive pool for `ip:port`, created on first use.
    pub fn pool(&self, ip: &str, port: u16) -> Arc<ConnectionPool> {
        let addr = format!("{ip}:{port}");
        if let Some(pool) = self.pools.read().get(&addr) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write();
        Arc::clone(pools.entry(addr.clone()).or_insert_with(|| {
            Arc::new(ConnectionPool::new(addr, Arc::clone(&self.config)))
        }))
    }

    /// Idempotent bootstrap: at most one `CLUSTER SLOTS` query per cluster
    /// per process, and none at all when another client already cached the
    /// topology in the shared dict.
    pub async fn init_slots(&self) -> Result<()> {
        if self.snapshot().is_some() {
            return Ok(());
        }
        let init_lock = Arc::clone(&self.init_lock);
        let _guard = init_lock.lock().await;
        if self.snapshot().is_some() {
            return Ok(());
        }
        match self.load_slots_from_store() {
            Ok(()) => return Ok(()),
            Err(e) => debug!(cluster = %self.config.name, error = %e, "no usable cached slots"),
        }
        self.fetch_slots().await
    }

    /// Query the topology from the first reachable host: cached servers
    /// first, configured seeds appended. Installs the snapshot and writes
    /// the shared dict on success; aggregates every per-host cause on
    /// failure.
    pub async fn fetch_slots(&self) -> Result<()> {
        let started = Instant::now();
        let budget = Duration::from_millis(self.config.max_connection_timeout_ms);

        let mut candidates: Vec<(String, u16)> = Vec::new();
        let mut seen = HashSet::new();
        if let Some(snapshot) = self.snapshot() {
            for server in snapshot.servers() {
                if seen.insert(server.addr()) {
                    candidates.push((server.ip.clone(), server.port));
                }
            }
        }
        for (host, port) in &self.config.serv_list {
            if seen.insert(format!("{host}:{port}")) {
                candidates.push((host.clone(), *port));
            }
        }

        let mut causes = Vec::new();
        for (host, port) in candidates {
            if started.elapsed() >= budget {
                causes.push(format!("{host}:{port}: bootstrap budget exhausted"));
                break;
            }
            match self.query_node(&host, port, started, budget).await {
                Ok(ranges) => {
                    self.install(Arc::new(TopologySnapshot::from_ranges(&ranges)));
                    self.cache_slots_to_store(&ranges);
                    debug!(cluster = %self.config.name, host, port, "installed topology");
                    return Ok(());
                }
                // Rejected credentials will be rejected everywhere.
                Err(e @ Error::Auth(_)) => return Err(e),
                Err(e) => {
                    warn!(cluster = %self.config.name, host, port, error = %e, "topology query failed");
                    causes.push(format!("{host}:{port}: {e}"));
                }
            }
        }
        Err(Error::Bootstrap(causes))
    }

    /// Non-blocking refresh: concurrent callers return [`Error::RefreshRace`]
    /// immediately instead of piling up behind one another.
    pub async fn refresh_slots(&self) -> Result<()> {
        let refresh_lock = Arc::clone(&self.refresh_lock);
        let _guard = match refresh_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Err(Error::RefreshRace),
        };
        self.fetch_slots().await
    }

    /// Install the topology cached in the shared slots dict, if present
    /// and decodable. Best effort: callers fall back to the network.
    pub fn load_slots_from_store(&self) -> Result<()> {
        let dict = SharedDict::named(&self.config.dict_name);
        let raw = dict
            .get(&self.config.name)
            .ok_or_else(|| Error::Protocol("no cached slots info".into()))?;
        let ranges = store::decode_topology(&raw)?;
        self.install(Arc::new(TopologySnapshot::from_ranges(&ranges)));
        Ok(())
    }

    /// Persist the raw topology to the shared slots dict so other clients
    /// of this cluster can skip their bootstrap query.
    pub fn cache_slots_to_store(&self, ranges: &[RawSlotRange]) {
        let dict = SharedDict::named(&self.config.dict_name);
        dict.set(&self.config.name, store::encode_topology(ranges));
    }

    /// Connect-with-retry to one host, honoring the per-host attempt budget
    /// and the shared wall-clock budget, then run `CLUSTER SLOTS`.
    async fn query_node(
        &self,
        host: &str,
        port: u16,
        started: Instant,
        budget: Duration,
    ) -> Result<Vec<RawSlotRange>> {
        let addr = format!("{host}:{port}");
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let mut last_err = None;

        for _ in 0..self.config.max_connection_attempts() {
            if started.elapsed() >= budget {
                return Err(last_err
                    .unwrap_or_else(|| Error::Timeout("bootstrap budget exhausted".into())));
            }
            let mut conn = match RedisConnection::connect(
                &addr,
                connect_timeout,
                &self.config.connect_opts,
            )
            .await
            {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(addr = %addr, error = %e, "bootstrap connect attempt failed");
                    last_err = Some(e);
                    continue;
                }
            };
            conn.set_timeouts(
                Some(Duration::from_millis(self.config.send_timeout_ms)),
                Some(Duration::from_millis(self.config.read_timeout_ms)),
            );
            if let Some(password) = self.config.password.as_deref() {
                conn.auth(self.config.username.as_deref(), password).await?;
            }
            let reply = conn.execute_str(&["CLUSTER", "SLOTS"]).await?;
            if let RespValue::Error(msg) = &reply {
                return Err(Error::redis(msg.clone()));
            }
            return parse_cluster_slots(&reply);
        }
        Err(last_err.unwrap_or_else(|| Error::Timeout("bootstrap budget exhausted".into())))
    }
}

/// Fire a best-effort background refresh. Losing the refresh race is
/// expected under redirect storms and only logged.
pub fn spawn_refresh(state: &Arc<ClusterState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        match state.refresh_slots().await {
            Ok(()) => {}
            Err(Error::RefreshRace) => {
                debug!(cluster = %state.config.name, "refresh already in flight");
            }
            Err(e) => {
                warn!(cluster = %state.config.name, error = %e, "background slot refresh failed");
            }
        }
    });
}
