//! Crate-wide error type and Redis error-reply classification.
//!
//! Redis signals cluster redirections as error replies (`MOVED`, `ASK`);
//! [`RedisErrorKind`] gives the routing layer a structured view of those
//! strings so the retry loop can act on them.

use std::fmt;
use std::io;

/// Structured classification of a Redis error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisErrorKind {
    /// Generic ERR
    Err,
    /// WRONGTYPE Operation against a key holding the wrong kind of value
    WrongType,
    /// MOVED slot host:port — permanent redirection
    Moved { slot: u16, host: String, port: u16 },
    /// ASK slot host:port — in-flight migration redirection
    Ask { slot: u16, host: String, port: u16 },
    /// CLUSTERDOWN — the cluster cannot serve the slot
    ClusterDown,
    /// TRYAGAIN — multi-key operation interrupted by a migration
    TryAgain,
    /// LOADING Redis is loading the dataset in memory
    Loading,
    /// READONLY You can't write against a read only replica
    ReadOnly,
    /// NOSCRIPT No matching script
    NoScript,
    /// BUSY Redis is busy running a script
    Busy,
    /// Any other error prefix
    Other(String),
}

impl RedisErrorKind {
    /// Classify a Redis error reply string.
    ///
    /// `MOVED` and `ASK` are decoded into `(slot, host, port)`. A reply
    /// carrying one of those prefixes with a body that does not match
    /// `<slot> <host>:<port>` is a protocol error, not an [`Other`]
    /// classification — a half-formed redirect must never be retried as if
    /// it were an ordinary failure.
    ///
    /// [`Other`]: RedisErrorKind::Other
    pub fn from_error_msg(msg: &str) -> Result<Self> {
        if let Some(rest) = msg.strip_prefix("MOVED ") {
            return Self::parse_redirect("MOVED", rest)
                .map(|(slot, host, port)| Self::Moved { slot, host, port });
        }
        if let Some(rest) = msg.strip_prefix("ASK ") {
            return Self::parse_redirect("ASK", rest)
                .map(|(slot, host, port)| Self::Ask { slot, host, port });
        }

        let kind = if msg.starts_with("CLUSTERDOWN") {
            Self::ClusterDown
        } else if msg.starts_with("TRYAGAIN") {
            Self::TryAgain
        } else if msg.starts_with("WRONGTYPE") {
            Self::WrongType
        } else if msg.starts_with("LOADING") {
            Self::Loading
        } else if msg.starts_with("READONLY") {
            Self::ReadOnly
        } else if msg.starts_with("NOSCRIPT") {
            Self::NoScript
        } else if msg.starts_with("BUSY") {
            Self::Busy
        } else if msg.starts_with("ERR") {
            Self::Err
        } else {
            let prefix = msg.split_whitespace().next().unwrap_or("UNKNOWN");
            Self::Other(prefix.to_string())
        };
        Ok(kind)
    }

    /// Decode `<slot> <host>:<port>` after a redirect prefix.
    fn parse_redirect(prefix: &str, rest: &str) -> Result<(u16, String, u16)> {
        let malformed = || Error::Protocol(format!("malformed {prefix} redirect: {prefix} {rest}"));
        let (slot_str, addr) = rest.split_once(' ').ok_or_else(malformed)?;
        let slot = slot_str.parse::<u16>().map_err(|_| malformed())?;
        // rsplit: the host part may itself contain ':' (IPv6).
        let (host, port_str) = addr.rsplit_once(':').ok_or_else(malformed)?;
        let port = port_str.parse::<u16>().map_err(|_| malformed())?;
        if host.is_empty() {
            return Err(malformed());
        }
        Ok((slot, host.to_string(), port))
    }

    /// Redirect target, if this is a MOVED or ASK classification.
    pub fn redirect_target(&self) -> Option<(&str, u16)> {
        match self {
            Self::Moved { host, port, .. } | Self::Ask { host, port, .. } => {
                Some((host.as_str(), *port))
            }
            _ => None,
        }
    }
}

/// All error variants surfaced by this crate.
#[derive(Debug)]
pub enum Error {
    /// Invalid client configuration (missing name, empty serv_list, …).
    Config(String),
    /// Every candidate host failed during bootstrap; carries per-host causes.
    Bootstrap(Vec<String>),
    /// The slot has no replica set in the cached topology.
    SlotsAbsent,
    /// AUTH was rejected by the server.
    Auth(String),
    /// TCP / IO level errors.
    Connection(io::Error),
    /// An I/O operation exceeded its timeout.
    Timeout(String),
    /// The keepalive pool is saturated; a load signal, never a topology one.
    PoolBusy,
    /// Redis returned an error reply, classified by kind.
    Redis { kind: RedisErrorKind, message: String },
    /// A reply carried the CLUSTERDOWN prefix.
    ClusterDown(String),
    /// The server replied ASK to a request that was already ASK-directed.
    NestedAsk,
    /// Command rejected before any network activity.
    Unsupported(String),
    /// The redirection retry budget is exhausted.
    MaxRedirections(u32),
    /// `commit` was called on an empty pipeline.
    PipelineEmpty,
    /// A pipeline node connection failed; annotated with the node address.
    PipelineConnect { addr: String, source: Box<Error> },
    /// A pipeline send/receive failed; annotated with the node address.
    PipelineCommit { addr: String, source: Box<Error> },
    /// A broadcast command failed on one or more masters.
    Broadcast(Vec<String>),
    /// Another refresh is already in flight for this cluster.
    RefreshRace,
    /// Malformed RESP data or malformed redirect reply.
    Protocol(String),
    /// RESP parser needs more data — control flow, not a caller-visible error.
    Incomplete,
}

impl Error {
    /// Wrap a raw Redis error reply, classifying its kind.
    ///
    /// A malformed MOVED/ASK body degrades to the protocol error it is.
    pub fn redis(msg: impl Into<String>) -> Self {
        let message = msg.into();
        match RedisErrorKind::from_error_msg(&message) {
            Ok(kind) => Self::Redis { kind, message },
            Err(e) => e,
        }
    }

    /// True when the error is pool saturation or a timeout: a sign of load,
    /// not of a stale topology, so it must not trigger a slot refresh.
    pub fn is_pool_pressure(&self) -> bool {
        matches!(self, Self::PoolBusy | Self::Timeout(_))
    }

    /// MOVED target, if this wraps a MOVED reply.
    pub fn moved_target(&self) -> Option<(&str, u16)> {
        match self {
            Self::Redis { kind: RedisErrorKind::Moved { host, port, .. }, .. } => {
                Some((host.as_str(), *port))
            }
            _ => None,
        }
    }

    /// ASK target, if this wraps an ASK reply.
    pub fn ask_target(&self) -> Option<(&str, u16)> {
        match self {
            Self::Redis { kind: RedisErrorKind::Ask { host, port, .. }, .. } => {
                Some((host.as_str(), *port))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Bootstrap(causes) => {
                write!(f, "failed to fetch slots from every host: {}", causes.join("; "))
            }
            Self::SlotsAbsent => write!(f, "no slots information present"),
            Self::Auth(msg) => write!(f, "auth failed: {msg}"),
            Self::Connection(e) => write!(f, "connection error: {e}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::PoolBusy => write!(f, "too many waiting connect operations"),
            Self::Redis { message, .. } => write!(f, "redis error: {message}"),
            Self::ClusterDown(msg) => write!(f, "cluster is down: {msg}"),
            Self::NestedAsk => write!(f, "nested asking redirection"),
            Self::Unsupported(cmd) => write!(f, "command not supported: {cmd}"),
            Self::MaxRedirections(n) => {
                write!(f, "reached maximum redirection attempts ({n})")
            }
            Self::PipelineEmpty => write!(f, "no command queued in pipeline"),
            Self::PipelineConnect { addr, source } => {
                write!(f, "pipeline connect to {addr} failed: {source}")
            }
            Self::PipelineCommit { addr, source } => {
                write!(f, "pipeline commit to {addr} failed: {source}")
            }
            Self::Broadcast(causes) => {
                write!(f, "broadcast failed: {}", causes.join("; "))
            }
            Self::RefreshRace => write!(f, "another refresh is already running"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Incomplete => write!(f, "incomplete RESP message"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::PipelineConnect { source, .. } | Self::PipelineCommit { source, .. } => {
                Some(source.as_ref())
            }
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Connection(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
