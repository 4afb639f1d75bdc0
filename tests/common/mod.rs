//! Shared mock-cluster helpers for integration tests.
//!
//! Nodes are scripted RESP servers bound to ephemeral ports. Every node
//! answers `CLUSTER SLOTS` with the harness topology; everything else goes
//! through the test's handler. Received commands and accepted connections
//! are recorded so tests can assert what actually went over the wire.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use slotroute::config::ClusterConfig;
use slotroute::crc16::slot_for_key;
use slotroute::resp::parser::parse_slice;
use slotroute::error::Error;

/// Scripted reply logic: command args in, raw wire bytes out.
pub type Handler = Arc<dyn Fn(&[String]) -> Vec<u8> + Send + Sync>;

static TEST_ID: AtomicUsize = AtomicUsize::new(0);

/// Unique prefix per test, so process-wide cluster state never collides.
pub fn test_prefix() -> String {
    let id = TEST_ID.fetch_add(1, Ordering::Relaxed);
    format!("slotroute_test_{}_{id}", std::process::id())
}

/// One mock node.
pub struct MockNode {
    pub port: u16,
    log: Arc<Mutex<Vec<Vec<String>>>>,
    connections: Arc<AtomicUsize>,
}

impl MockNode {
    pub fn addr(&self) -> (String, u16) {
        ("127.0.0.1".to_string(), self.port)
    }

    /// Every command this node received, in arrival order.
    pub fn log(&self) -> Vec<Vec<String>> {
        self.log.lock().clone()
    }

    /// How many commands named `cmd` arrived (case-insensitive).
    pub fn count(&self, cmd: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|args| args.first().is_some_and(|c| c.eq_ignore_ascii_case(cmd)))
            .count()
    }

    /// TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

/// A scripted cluster plus the client config pointing at it.
pub struct MockCluster {
    pub nodes: Vec<MockNode>,
    pub config: ClusterConfig,
}

impl MockCluster {
    /// Total `CLUSTER SLOTS` queries across every node (bootstrap and
    /// refresh traffic).
    pub fn topology_queries(&self) -> usize {
        self.nodes.iter().map(|n| n.count("CLUSTER")).sum()
    }
}

/// Start `ranges.len()` nodes where node `i` masters `ranges[i]`, with no
/// replicas, all answering through `handlers[i]`.
pub async fn start_cluster(ranges: &[(u16, u16)], handlers: Vec<Handler>) -> MockCluster {
    let topology: Vec<(u16, u16, Vec<usize>)> = ranges
        .iter()
        .enumerate()
        .map(|(i, &(start, end))| (start, end, vec![i]))
        .collect();
    start_cluster_with_topology(&topology, handlers).await
}

/// Start a cluster with an explicit range→nodes topology. The first node
/// index of each range is the master, the rest are its replicas.
pub async fn start_cluster_with_topology(
    topology: &[(u16, u16, Vec<usize>)],
    handlers: Vec<Handler>,
) -> MockCluster {
    let topology = topology.to_vec();
    start_cluster_custom(handlers, move |ports| {
        topology
            .iter()
            .map(|(start, end, nodes)| {
                (*start, *end, nodes.iter().map(|&i| ports[i]).collect())
            })
            .collect()
    })
    .await
}

/// Start a cluster whose advertised topology is derived from the live node
/// ports by `topology_fn` — the returned port topology may reference ports
/// with nothing listening, for tests that need unreachable owners.
pub async fn start_cluster_custom(
    handlers: Vec<Handler>,
    topology_fn: impl FnOnce(&[u16]) -> Vec<(u16, u16, Vec<u16>)>,
) -> MockCluster {
    let mut listeners = Vec::with_capacity(handlers.len());
    let mut ports = Vec::with_capacity(handlers.len());
    for _ in 0..handlers.len() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ports.push(listener.local_addr().unwrap().port());
        listeners.push(listener);
    }

    let port_topology = topology_fn(&ports);
    let slots = slots_wire(&port_topology);

    let mut nodes = Vec::with_capacity(handlers.len());
    for (listener, handler) in listeners.into_iter().zip(handlers) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(node_loop(
            listener,
            slots.clone(),
            handler,
            Arc::clone(&log),
            Arc::clone(&connections),
        ));
        nodes.push(MockNode { port, log, connections });
    }

    let prefix = test_prefix();
    let config = ClusterConfig {
        dict_name: format!("{prefix}_dict"),
        connect_timeout_ms: 500,
        send_timeout_ms: 500,
        read_timeout_ms: 500,
        ..ClusterConfig::new(prefix, nodes.iter().map(|n| n.addr()).collect())
    };

    MockCluster { nodes, config }
}

async fn node_loop(
    listener: TcpListener,
    slots: Vec<u8>,
    handler: Handler,
    log: Arc<Mutex<Vec<Vec<String>>>>,
    connections: Arc<AtomicUsize>,
) {
    loop {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        connections.fetch_add(1, Ordering::Relaxed);
        let slots = slots.clone();
        let handler = Arc::clone(&handler);
        let log = Arc::clone(&log);
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            let mut chunk = vec![0u8; 4096];
            loop {
                while let Some(args) = take_command(&mut buf) {
                    log.lock().push(args.clone());
                    let reply = if args.first().is_some_and(|c| c.eq_ignore_ascii_case("CLUSTER"))
                    {
                        slots.clone()
                    } else {
                        handler(&args)
                    };
                    if socket.write_all(&reply).await.is_err() {
                        return;
                    }
                }
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
        });
    }
}

/// Pop one complete command (RESP array of bulk strings) off the buffer.
fn take_command(buf: &mut Vec<u8>) -> Option<Vec<String>> {
    if buf.is_empty() {
        return None;
    }
    match parse_slice(buf) {
        Ok((value, consumed)) => {
            buf.drain(..consumed);
            let items = value.into_array()?;
            Some(
                items
                    .iter()
                    .map(|item| item.as_str().unwrap_or_default().to_string())
                    .collect(),
            )
        }
        Err(Error::Incomplete) => None,
        Err(e) => panic!("mock node received malformed command: {e}"),
    }
}

/// RESP wire bytes of a `CLUSTER SLOTS` reply.
pub fn slots_wire(topology: &[(u16, u16, Vec<u16>)]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", topology.len()).into_bytes();
    for (start, end, ports) in topology {
        out.extend_from_slice(format!("*{}\r\n:{start}\r\n:{end}\r\n", 2 + ports.len()).as_bytes());
        for port in ports {
            out.extend_from_slice(
                format!("*3\r\n$9\r\n127.0.0.1\r\n:{port}\r\n$6\r\nnodeid\r\n").as_bytes(),
            );
        }
    }
    out
}

// ── Scripted replies ──────────────────────────────────────────────

pub fn ok() -> Vec<u8> {
    b"+OK\r\n".to_vec()
}

pub fn bulk(s: &str) -> Vec<u8> {
    format!("${}\r\n{s}\r\n", s.len()).into_bytes()
}

pub fn int(n: i64) -> Vec<u8> {
    format!(":{n}\r\n").into_bytes()
}

pub fn nil() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn err(msg: &str) -> Vec<u8> {
    format!("-{msg}\r\n").into_bytes()
}

pub fn moved(slot: u16, port: u16) -> Vec<u8> {
    err(&format!("MOVED {slot} 127.0.0.1:{port}"))
}

pub fn ask(slot: u16, port: u16) -> Vec<u8> {
    err(&format!("ASK {slot} 127.0.0.1:{port}"))
}

/// Handler that answers everything with +OK.
pub fn always_ok() -> Handler {
    Arc::new(|_args: &[String]| ok())
}

/// A local port with nothing listening on it.
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Find a key named `{prefix}<n>` whose slot falls inside `[start, end]`.
pub fn key_in_range(prefix: &str, start: u16, end: u16) -> String {
    for i in 0..100_000u32 {
        let key = format!("{prefix}{i}");
        let slot = slot_for_key(&key);
        if (start..=end).contains(&slot) {
            return key;
        }
    }
    panic!("no key found for slot range [{start}, {end}]");
}

/// The standard three-master split used by most tests.
pub const THREE_RANGES: [(u16, u16); 3] = [(0, 5460), (5461, 10922), (10923, 16383)];
