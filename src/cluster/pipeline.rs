//! Pipelined execution across the cluster.
//!
//! A batch is partitioned by destination node, each partition goes out as
//! one pipelined write, and the replies are reassembled into the caller's
//! submission order. Entries that come back as MOVED or ASK are re-driven
//! individually through the single-command executor.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tracing::warn;

use crate::cluster::executor::{execute_with_retry, wire_args};
use crate::cluster::topology::{spawn_refresh, ClusterState};
use crate::crc16::slot_for_key;
use crate::error::{Error, RedisErrorKind, Result};
use crate::resp::types::RespValue;
use crate::resp::writer::encode_pipeline;

/// One queued pipeline entry.
#[derive(Debug, Clone)]
struct Request {
    cmd: String,
    key: String,
    args: Vec<String>,
    /// Submission position; reassembly places the reply back here.
    origin_index: usize,
}

/// Requests bound for one node, in submission order.
struct NodeGroup {
    ip: String,
    port: u16,
    is_replica: bool,
    requests: Vec<Request>,
}

impl NodeGroup {
    fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// A batch of commands committed as per-node pipelines.
///
/// Queued commands are not executed until [`commit`](Self::commit); dropping
/// the pipeline (or calling [`cancel`](Self::cancel)) discards them.
pub struct ClusterPipeline {
    state: Arc<ClusterState>,
    queue: Vec<Request>,
}

impl ClusterPipeline {
    pub(crate) fn new(state: Arc<ClusterState>) -> Self {
        Self {
            state,
            queue: Vec::new(),
        }
    }

    /// Queue a command. EVAL/EVALSHA take the script in the `key` position
    /// and their remaining arguments (numkeys first) in `args`, like the
    /// single-command path.
    pub fn cmd(&mut self, cmd: &str, key: &str, args: &[&str]) -> &mut Self {
        self.queue.push(Request {
            cmd: cmd.to_string(),
            key: key.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            origin_index: self.queue.len(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Discard every queued command.
    pub fn cancel(&mut self) {
        self.queue.clear();
    }

    /// Execute the queued commands and return their replies in submission
    /// order, regardless of how the batch was partitioned across nodes.
    pub async fn commit(&mut self) -> Result<Vec<RespValue>> {
        let requests = std::mem::take(&mut self.queue);
        if requests.is_empty() {
            return Err(Error::PipelineEmpty);
        }
        let total = requests.len();
        let state = Arc::clone(&self.state);

        let groups = partition(&state, requests)?;

        // Fan the per-node pipelines out concurrently; the first failure
        // aborts the commit.
        let mut join_set = tokio::task::JoinSet::new();
        for group in groups {
            let state = Arc::clone(&state);
            join_set.spawn(async move {
                let replies = run_group(&state, &group).await;
                (group, replies)
            });
        }
        let mut outputs = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let (group, replies) =
                joined.map_err(|e| Error::Protocol(format!("pipeline task failed: {e}")))?;
            outputs.push((group, replies?));
        }

        // A CLUSTERDOWN anywhere in any reply fails the whole commit.
        for (_, replies) in &outputs {
            for reply in replies {
                if let Some(msg) = find_cluster_down(reply) {
                    return Err(Error::ClusterDown(msg.to_string()));
                }
            }
        }

        reassemble(&state, outputs, total).await
    }
}

/// Group requests by destination node under one topology snapshot.
///
/// A single magic seed drawn from `[1, server_count]` is shared by every
/// pick, so the whole batch lands on one replica-set position instead of
/// fanning across all replicas.
fn partition(state: &Arc<ClusterState>, requests: Vec<Request>) -> Result<Vec<NodeGroup>> {
    let Some(snapshot) = state.snapshot() else {
        spawn_refresh(state);
        return Err(Error::SlotsAbsent);
    };
    let seed = rand::thread_rng().gen_range(1..=snapshot.servers().len().max(1) as u64);
    let enable_slave_read = state.config().enable_slave_read;

    let mut groups: HashMap<String, NodeGroup> = HashMap::new();
    for (origin_index, mut request) in requests.into_iter().enumerate() {
        request.origin_index = origin_index;
        let slot = slot_for_key(&request.key);
        let Some(replica_set) = snapshot.replica_set(slot) else {
            spawn_refresh(state);
            return Err(Error::SlotsAbsent);
        };
        let (ip, port, is_replica) = match replica_set.pick(enable_slave_read, Some(seed)) {
            Ok(picked) => picked,
            Err(e) => {
                spawn_refresh(state);
                return Err(e);
            }
        };
        groups
            .entry(format!("{ip}:{port}"))
            .or_insert_with(|| NodeGroup {
                ip,
                port,
                is_replica,
                requests: Vec::new(),
            })
            .requests
            .push(request);
    }
    // The snapshot drops here, before any I/O.
    Ok(groups.into_values().collect())
}

/// Run one node's pipeline: single write, N reads, replies in order.
async fn run_group(state: &Arc<ClusterState>, group: &NodeGroup) -> Result<Vec<RespValue>> {
    let addr = group.addr();
    let pool = state.pool(&group.ip, group.port);
    let mut guard = match pool.get().await {
        Ok(guard) => guard,
        Err(e) => {
            if !e.is_pool_pressure() {
                spawn_refresh(state);
            }
            return Err(Error::PipelineConnect { addr, source: Box::new(e) });
        }
    };
    if group.is_replica {
        if let Err(e) = guard.conn().readonly().await {
            spawn_refresh(state);
            return Err(Error::PipelineConnect { addr, source: Box::new(e) });
        }
    }

    let commands: Vec<Vec<String>> = group
        .requests
        .iter()
        .map(|r| {
            wire_args(&r.cmd, &r.key, &r.args)
                .into_iter()
                .map(str::to_string)
                .collect()
        })
        .collect();
    let buf = encode_pipeline(&commands);

    if let Err(e) = guard.conn().send_raw(&buf).await {
        guard.discard();
        spawn_refresh(state);
        return Err(Error::PipelineCommit { addr, source: Box::new(e) });
    }
    let mut replies = Vec::with_capacity(group.requests.len());
    for _ in &group.requests {
        match guard.conn().read_response().await {
            Ok(reply) => replies.push(reply),
            Err(e) => {
                guard.discard();
                spawn_refresh(state);
                return Err(Error::PipelineCommit { addr, source: Box::new(e) });
            }
        }
    }
    Ok(replies)
}

/// Place every reply at its origin index, re-driving redirected entries
/// through the single-command executor. The slot table is refreshed at most
/// once per commit, however many entries came back MOVED.
async fn reassemble(
    state: &Arc<ClusterState>,
    outputs: Vec<(NodeGroup, Vec<RespValue>)>,
    total: usize,
) -> Result<Vec<RespValue>> {
    let mut results: Vec<Option<RespValue>> = vec![None; total];
    let mut refreshed = false;

    for (group, replies) in outputs {
        for (request, reply) in group.requests.iter().zip(replies) {
            let value = match reply {
                RespValue::Error(msg) => match RedisErrorKind::from_error_msg(&msg)? {
                    RedisErrorKind::Ask { host, port, .. } => {
                        execute_with_retry(
                            state,
                            Some((host, port)),
                            true,
                            &request.cmd,
                            &request.key,
                            &request.args,
                        )
                        .await?
                    }
                    RedisErrorKind::Moved { host, port, .. } => {
                        if !refreshed {
                            refreshed = true;
                            match state.refresh_slots().await {
                                Ok(()) | Err(Error::RefreshRace) => {}
                                Err(e) => {
                                    warn!(cluster = %state.config().name, error = %e,
                                        "slot refresh during pipeline commit failed");
                                }
                            }
                        }
                        execute_with_retry(
                            state,
                            Some((host, port)),
                            false,
                            &request.cmd,
                            &request.key,
                            &request.args,
                        )
                        .await?
                    }
                    _ => RespValue::Error(msg),
                },
                other => other,
            };
            results[request.origin_index] = Some(value);
        }
    }

    Ok(results
        .into_iter()
        .map(|r| r.unwrap_or(RespValue::Null))
        .collect())
}

/// Depth-first scan for a CLUSTERDOWN error anywhere inside a reply.
fn find_cluster_down(reply: &RespValue) -> Option<&str> {
    match reply {
        RespValue::Error(msg) if msg.starts_with("CLUSTERDOWN") => Some(msg),
        RespValue::Array(items) => items.iter().find_map(find_cluster_down),
        _ => None,
    }
}
