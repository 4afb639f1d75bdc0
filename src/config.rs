//! Cluster client configuration.
//!
//! Built directly or parsed from a `redis+cluster://` URL:
//! `redis+cluster://[user:pass@]host[:port][,host[:port]…]`

use crate::error::{Error, Result};

/// Default Redis port.
pub const DEFAULT_PORT: u16 = 6379;

const DEFAULT_MAX_REDIRECTION: u32 = 5;
const DEFAULT_MAX_CONNECTION_ATTEMPTS: u32 = 3;

/// Low-level socket options applied to every connection.
#[derive(Debug, Clone)]
pub struct ConnectOpts {
    /// Disable Nagle for request/response latency.
    pub tcp_nodelay: bool,
    /// Maximum read buffer size per connection in bytes.
    pub max_buffer_size: usize,
}

impl Default for ConnectOpts {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            max_buffer_size: 64 * 1024 * 1024,
        }
    }
}

/// Immutable per-client cluster configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster name; keys the process-wide slot cache.
    pub name: String,
    /// Seed nodes used for bootstrap and as fallback after topology loss.
    pub serv_list: Vec<(String, u16)>,
    /// Optional username (Redis 6+ ACL).
    pub username: Option<String>,
    /// Optional password.
    pub password: Option<String>,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Send timeout in milliseconds.
    pub send_timeout_ms: u64,
    /// Read timeout in milliseconds.
    pub read_timeout_ms: u64,
    /// How long an idle connection stays in the keepalive pool.
    pub keepalive_timeout_ms: u64,
    /// Keepalive pool bound per node.
    pub keepalive_cons: usize,
    /// Redirection retry budget. 0 means "use the default" (5).
    pub max_redirection: u32,
    /// Connect attempts per seed during bootstrap. 0 means default (3).
    pub max_connection_attempts: u32,
    /// Wall-clock budget across all bootstrap connect retries.
    pub max_connection_timeout_ms: u64,
    /// Route reads through replicas.
    pub enable_slave_read: bool,
    /// Name of the shared dictionary backing the init and refresh locks.
    pub lock_dict_name: String,
    /// Name of the shared slots-info dictionary entry.
    pub dict_name: String,
    /// Key of the refresh lock inside the lock dictionary.
    pub refresh_lock_key: String,
    /// Socket options.
    pub connect_opts: ConnectOpts,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            serv_list: Vec::new(),
            username: None,
            password: None,
            connect_timeout_ms: 1_000,
            send_timeout_ms: 1_000,
            read_timeout_ms: 1_000,
            keepalive_timeout_ms: 55_000,
            keepalive_cons: 1_000,
            max_redirection: DEFAULT_MAX_REDIRECTION,
            max_connection_attempts: DEFAULT_MAX_CONNECTION_ATTEMPTS,
            max_connection_timeout_ms: 3_000,
            enable_slave_read: false,
            lock_dict_name: "redis_cluster_slot_locks".to_string(),
            dict_name: "redis_cluster_slots".to_string(),
            refresh_lock_key: "refresh_lock".to_string(),
            connect_opts: ConnectOpts::default(),
        }
    }
}

impl ClusterConfig {
    /// Minimal constructor for the common case.
    pub fn new(name: impl Into<String>, serv_list: Vec<(String, u16)>) -> Self {
        Self {
            name: name.into(),
            serv_list,
            ..Self::default()
        }
    }

    /// Parse `redis+cluster://[user:pass@]host[:port][,host[:port]…]`.
    ///
    /// The cluster name defaults to the first host's address and can be
    /// overridden afterwards.
    pub fn from_url(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("invalid URL, missing ://: {url}")))?;
        if scheme != "redis+cluster" {
            return Err(Error::Config(format!("unknown URL scheme: {scheme}")));
        }

        let mut config = Self::default();

        let hosts_str = if let Some((userinfo, hosts)) = rest.rsplit_once('@') {
            match userinfo.split_once(':') {
                Some((user, pass)) => {
                    if !user.is_empty() {
                        config.username = Some(user.to_string());
                    }
                    if !pass.is_empty() {
                        config.password = Some(pass.to_string());
                    }
                }
                None => {
                    if !userinfo.is_empty() {
                        config.password = Some(userinfo.to_string());
                    }
                }
            }
            hosts
        } else {
            rest
        };

        let mut nodes = Vec::new();
        for addr in hosts_str.split(',') {
            let addr = addr.trim().trim_end_matches('/');
            if addr.is_empty() {
                continue;
            }
            nodes.push(parse_host_port(addr, DEFAULT_PORT)?);
        }
        if nodes.is_empty() {
            return Err(Error::Config(
                "cluster URL must include at least one node".into(),
            ));
        }

        config.name = format!("{}:{}", nodes[0].0, nodes[0].1);
        config.serv_list = nodes;
        Ok(config)
    }

    /// Validate the fields a client cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("cluster name is required".into()));
        }
        if self.serv_list.is_empty() {
            return Err(Error::Config("serv_list is empty".into()));
        }
        Ok(())
    }

    /// Redirection budget with the zero-means-default fallback applied.
    pub fn max_redirection(&self) -> u32 {
        if self.max_redirection == 0 {
            DEFAULT_MAX_REDIRECTION
        } else {
            self.max_redirection
        }
    }

    /// Connect-attempt budget with the zero-means-default fallback applied.
    pub fn max_connection_attempts(&self) -> u32 {
        if self.max_connection_attempts == 0 {
            DEFAULT_MAX_CONNECTION_ATTEMPTS
        } else {
            self.max_connection_attempts
        }
    }
}

/// Parse `host[:port]` or `[ipv6]:port`.
fn parse_host_port(s: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(stripped) = s.strip_prefix('[') {
        // IPv6 in brackets: [::1]:6379
        let close = stripped
            .find(']')
            .ok_or_else(|| Error::Config(format!("unclosed IPv6 bracket: {s}")))?;
        let host = stripped[..close].to_string();
        let after = &stripped[close + 1..];
        let port = if let Some(port_str) = after.strip_prefix(':') {
            port_str
                .parse()
                .map_err(|_| Error::Config(format!("invalid port: {port_str}")))?
        } else {
            default_port
        };
        return Ok((host, port));
    }

    if let Some((host, port_str)) = s.rsplit_once(':') {
        match port_str.parse::<u16>() {
            Ok(port) if !host.is_empty() => return Ok((host.to_string(), port)),
            Ok(port) => return Ok(("127.0.0.1".to_string(), port)),
            Err(_) if host.contains(':') => {
                // Bare IPv6 without brackets.
                return Ok((s.to_string(), default_port));
            }
            Err(_) => return Err(Error::Config(format!("invalid port: {port_str}"))),
        }
    }

    Ok((s.to_string(), default_port))
}
