//! Cluster client facade.
//!
//! One entry point, [`ClusterClient::command`], routes any command by name:
//! blocked commands are rejected before touching the network, flush
//! commands broadcast to every master, EVAL goes through the key-extraction
//! shim, and everything else rides the slot-aware executor. Typed wrappers
//! for the common commands all delegate to `command`.

use std::sync::Arc;

use tracing::debug;

use crate::cluster::executor::execute_with_retry;
use crate::cluster::pipeline::ClusterPipeline;
use crate::cluster::topology::{spawn_refresh, ClusterState};
use crate::config::ClusterConfig;
use crate::crc16::NO_KEY;
use crate::error::{Error, Result};
use crate::resp::types::RespValue;

/// A slot-aware Redis Cluster client.
///
/// Cheap to clone; clones share the process-wide routing state of their
/// cluster name.
#[derive(Clone)]
pub struct ClusterClient {
    state: Arc<ClusterState>,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient").finish()
    }
}

impl ClusterClient {
    /// Validate `config` and bootstrap the slot directory.
    ///
    /// Bootstrap is idempotent per cluster name: concurrent constructions
    /// serialize on the init lock and at most one queries the cluster.
    pub async fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let state = ClusterState::get_or_create(config);
        state.init_slots().await?;
        Ok(Self { state })
    }

    /// Construct from a `redis+cluster://` URL.
    pub async fn from_url(url: &str) -> Result<Self> {
        Self::new(ClusterConfig::from_url(url)?).await
    }

    pub fn config(&self) -> &Arc<ClusterConfig> {
        self.state.config()
    }

    /// Start a pipeline bound to this client. Commands queue locally and
    /// execute on `commit`.
    pub fn pipeline(&self) -> ClusterPipeline {
        ClusterPipeline::new(Arc::clone(&self.state))
    }

    /// Execute a command by name.
    ///
    /// `key` is the routing key for ordinary commands and the script for
    /// EVAL/EVALSHA (whose real routing key, if any, sits in `args` after
    /// the numkeys count, exactly as on the Redis wire).
    pub async fn command(&self, cmd: &str, key: &str, args: &[&str]) -> Result<RespValue> {
        let upper = cmd.to_ascii_uppercase();
        match upper.as_str() {
            "CONFIG" | "SHUTDOWN" => Err(Error::Unsupported(upper)),
            "FLUSHALL" | "FLUSHDB" => self.broadcast(&upper).await,
            "EVAL" | "EVALSHA" => {
                let numkeys = args
                    .first()
                    .and_then(|s| s.parse::<usize>().ok())
                    .ok_or_else(|| {
                        Error::Config(format!("{upper} requires a numeric numkeys argument"))
                    })?;
                self.eval_command(&upper, key, numkeys, &args[1..]).await
            }
            _ => {
                let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
                execute_with_retry(&self.state, None, false, &upper, key, &owned).await
            }
        }
    }

    /// Run a Lua script. Cluster routing supports at most one key:
    /// zero keys route through the reserved `no_key` slot.
    pub async fn eval(
        &self,
        script: &str,
        numkeys: usize,
        keys_and_args: &[&str],
    ) -> Result<RespValue> {
        self.eval_command("EVAL", script, numkeys, keys_and_args).await
    }

    /// Run a cached script by SHA1, with the same key restrictions as
    /// [`eval`](Self::eval).
    pub async fn evalsha(
        &self,
        sha: &str,
        numkeys: usize,
        keys_and_args: &[&str],
    ) -> Result<RespValue> {
        self.eval_command("EVALSHA", sha, numkeys, keys_and_args).await
    }

    async fn eval_command(
        &self,
        cmd: &str,
        script: &str,
        numkeys: usize,
        keys_and_args: &[&str],
    ) -> Result<RespValue> {
        let routing_key = match numkeys {
            0 => NO_KEY.to_string(),
            1 => keys_and_args
                .first()
                .map(|k| k.to_string())
                .ok_or_else(|| {
                    Error::Config("eval declared one key but no key argument was given".into())
                })?,
            _ => {
                return Err(Error::Unsupported(
                    "cannot execute eval with more than one keys for redis cluster".into(),
                ))
            }
        };

        let mut raw_args = Vec::with_capacity(keys_and_args.len() + 2);
        raw_args.push(script.to_string());
        raw_args.push(numkeys.to_string());
        raw_args.extend(keys_and_args.iter().map(|s| s.to_string()));

        execute_with_retry(&self.state, None, false, cmd, &routing_key, &raw_args).await
    }

    /// Send `cmd` to every master in the current server list, aggregating
    /// per-node failures. The last successful reply is returned.
    async fn broadcast(&self, cmd: &str) -> Result<RespValue> {
        let Some(snapshot) = self.state.snapshot() else {
            spawn_refresh(&self.state);
            return Err(Error::SlotsAbsent);
        };
        let masters = snapshot.masters();
        drop(snapshot);

        let mut causes = Vec::new();
        let mut last_reply = None;
        for master in masters {
            let addr = master.addr();
            let pool = self.state.pool(&master.ip, master.port);
            let mut guard = match pool.get().await {
                Ok(guard) => guard,
                Err(e) => {
                    causes.push(format!("{addr}: {e}"));
                    continue;
                }
            };
            match guard.conn().execute_str(&[cmd]).await {
                Ok(RespValue::Error(msg)) => causes.push(format!("{addr}: {msg}")),
                Ok(reply) => last_reply = Some(reply),
                Err(e) => {
                    guard.discard();
                    causes.push(format!("{addr}: {e}"));
                }
            }
        }
        if !causes.is_empty() {
            debug!(cluster = %self.state.config().name, cmd, ?causes, "broadcast had failures");
            return Err(Error::Broadcast(causes));
        }
        last_reply.ok_or(Error::SlotsAbsent)
    }

    // ── Typed convenience commands ─────────────────────────────────

    pub async fn get(&self, key: &str) -> Result<RespValue> {
        self.command("GET", key, &[]).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<RespValue> {
        self.command("SET", key, &[value]).await
    }

    pub async fn del(&self, key: &str) -> Result<RespValue> {
        self.command("DEL", key, &[]).await
    }

    pub async fn exists(&self, key: &str) -> Result<RespValue> {
        self.command("EXISTS", key, &[]).await
    }

    pub async fn incr(&self, key: &str) -> Result<RespValue> {
        self.command("INCR", key, &[]).await
    }

    pub async fn expire(&self, key: &str, seconds: u64) -> Result<RespValue> {
        self.command("EXPIRE", key, &[&seconds.to_string()]).await
    }

    pub async fn ttl(&self, key: &str) -> Result<RespValue> {
        self.command("TTL", key, &[]).await
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<RespValue> {
        self.command("HSET", key, &[field, value]).await
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<RespValue> {
        self.command("HGET", key, &[field]).await
    }

    pub async fn lpush(&self, key: &str, value: &str) -> Result<RespValue> {
        self.command("LPUSH", key, &[value]).await
    }

    pub async fn rpush(&self, key: &str, value: &str) -> Result<RespValue> {
        self.command("RPUSH", key, &[value]).await
    }

    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<RespValue> {
        self.command("LRANGE", key, &[&start.to_string(), &stop.to_string()]).await
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<RespValue> {
        self.command("SADD", key, &[member]).await
    }

    pub async fn smembers(&self, key: &str) -> Result<RespValue> {
        self.command("SMEMBERS", key, &[]).await
    }
}
