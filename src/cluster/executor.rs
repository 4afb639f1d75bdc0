//! Single-command execution with redirection handling.
//!
//! One retry loop per command, bounded by `max_redirection`: resolve the
//! slot to a node, send, and interpret MOVED/ASK/CLUSTERDOWN replies.
//! Anything that smells like stale routing fires a background refresh;
//! pool saturation and timeouts never do.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cluster::topology::{spawn_refresh, ClusterState};
use crate::crc16::slot_for_key;
use crate::error::{Error, RedisErrorKind, Result};
use crate::resp::types::RespValue;

/// Build the wire arguments for a command.
///
/// EVAL and EVALSHA carry their script (not a key) in the first argument
/// position, so they go out with the caller's raw argument list; every
/// other command goes out as `(cmd, key, args…)`.
pub(crate) fn wire_args<'a>(cmd: &'a str, key: &'a str, args: &'a [String]) -> Vec<&'a str> {
    let mut out = Vec::with_capacity(args.len() + 2);
    out.push(cmd);
    if !cmd.eq_ignore_ascii_case("EVAL") && !cmd.eq_ignore_ascii_case("EVALSHA") {
        out.push(key);
    }
    out.extend(args.iter().map(String::as_str));
    out
}

/// Execute one command against the cluster, following redirections.
///
/// `target` pins the destination (used when re-driving a pipeline entry
/// after a redirect); `asking` marks an ASK-directed retry that needs the
/// ASKING handshake first.
pub async fn execute_with_retry(
    state: &Arc<ClusterState>,
    mut target: Option<(String, u16)>,
    mut asking: bool,
    cmd: &str,
    key: &str,
    args: &[String],
) -> Result<RespValue> {
    let slot = slot_for_key(key);
    let max_redirection = state.config().max_redirection();

    for attempt in 0..max_redirection {
        // Resolve the destination, copying it out of the snapshot so no
        // topology reference is held across I/O. A pinned target is always
        // treated as a master.
        let (ip, port, is_replica) = match target.clone() {
            Some((host, port)) => (host, port, false),
            None => {
                let Some(snapshot) = state.snapshot() else {
                    spawn_refresh(state);
                    return Err(Error::SlotsAbsent);
                };
                let Some(replica_set) = snapshot.replica_set(slot) else {
                    spawn_refresh(state);
                    return Err(Error::SlotsAbsent);
                };
                match replica_set.pick(state.config().enable_slave_read, None) {
                    Ok(picked) => picked,
                    Err(e) => {
                        spawn_refresh(state);
                        return Err(e);
                    }
                }
            }
        };

        let pool = state.pool(&ip, port);
        let mut guard = match pool.get().await {
            Ok(guard) => guard,
            Err(e) => {
                // Rejected credentials are never transient.
                if matches!(e, Error::Auth(_)) {
                    return Err(e);
                }
                if !e.is_pool_pressure() {
                    spawn_refresh(state);
                }
                if attempt + 1 == max_redirection {
                    return Err(e);
                }
                debug!(addr = %format!("{ip}:{port}"), error = %e, "connect failed, retrying");
                continue;
            }
        };

        if is_replica {
            if let Err(e) = guard.conn().readonly().await {
                spawn_refresh(state);
                return Err(e);
            }
        }
        if asking {
            if let Err(e) = guard.conn().asking().await {
                spawn_refresh(state);
                return Err(e);
            }
        }

        let wire = wire_args(cmd, key, args);
        let reply = match guard.conn().execute_str(&wire).await {
            Ok(reply) => reply,
            Err(e) => {
                // The connection state is unknown; pooling it could poison
                // a later caller.
                guard.discard();
                spawn_refresh(state);
                return Err(e);
            }
        };

        let msg = match reply {
            RespValue::Error(msg) => msg,
            reply => {
                // Clean reply: the connection goes back to the keepalive
                // pool on drop.
                drop(guard);
                return Ok(reply);
            }
        };

        match RedisErrorKind::from_error_msg(&msg)? {
            RedisErrorKind::Moved { host, port: new_port, .. } => {
                if host == ip && new_port == port {
                    // The node claims to own the slot yet redirects to
                    // itself; its replies cannot be trusted.
                    warn!(addr = %format!("{ip}:{port}"), "MOVED points at current node, closing");
                    guard.discard();
                } else {
                    drop(guard);
                }
                target = Some((host, new_port));
                asking = false;
                spawn_refresh(state);
            }
            RedisErrorKind::Ask { host, port: new_port, .. } => {
                drop(guard);
                if asking {
                    return Err(Error::NestedAsk);
                }
                target = Some((host, new_port));
                asking = true;
            }
            RedisErrorKind::ClusterDown => {
                drop(guard);
                return Err(Error::ClusterDown(msg));
            }
            _ => {
                drop(guard);
                spawn_refresh(state);
                return Err(Error::redis(msg));
            }
        }
    }

    Err(Error::MaxRedirections(max_redirection))
}
