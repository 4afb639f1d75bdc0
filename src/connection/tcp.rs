//! Async TCP connection to a single Redis node.
//!
//! Wraps a `tokio::net::TcpStream` with an integrated read buffer and the
//! streaming RESP parser, plus the handshakes cluster routing needs
//! (AUTH, READONLY, ASKING).

use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::ConnectOpts;
use crate::error::{Error, Result};
use crate::resp::parser::parse;
use crate::resp::types::RespValue;
use crate::resp::writer::encode_command_str;

const INITIAL_BUF_CAPACITY: usize = 16 * 1024;

/// One async connection to a Redis node.
pub struct RedisConnection {
    stream: TcpStream,
    /// Bytes read from the socket but not yet consumed by the parser.
    buf: BytesMut,
    max_buf_size: usize,
    send_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    /// How many times this connection came out of the keepalive pool.
    reused: u32,
    /// Timestamp of last successful I/O, for idle expiry.
    pub last_used: Instant,
}

impl RedisConnection {
    /// Connect to `addr` within `connect_timeout`.
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        opts: &ConnectOpts,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::Timeout(format!("connect to {addr} timed out after {connect_timeout:?}"))
            })??;
        if opts.tcp_nodelay {
            stream.set_nodelay(true).ok();
        }
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(INITIAL_BUF_CAPACITY),
            max_buf_size: opts.max_buffer_size,
            send_timeout: None,
            read_timeout: None,
            reused: 0,
            last_used: Instant::now(),
        })
    }

    /// Set the send and read timeouts applied to every subsequent I/O call.
    pub fn set_timeouts(&mut self, send: Option<Duration>, read: Option<Duration>) {
        self.send_timeout = send;
        self.read_timeout = read;
    }

    /// Times this connection was handed out again from the keepalive pool.
    pub fn reused(&self) -> u32 {
        self.reused
    }

    pub(crate) fn mark_reused(&mut self) {
        self.reused += 1;
    }

    /// Send raw bytes to the server.
    pub async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        match self.send_timeout {
            Some(dur) => tokio::time::timeout(dur, self.stream.write_all(data))
                .await
                .map_err(|_| Error::Timeout(format!("send timed out after {dur:?}")))??,
            None => self.stream.write_all(data).await?,
        }
        self.last_used = Instant::now();
        Ok(())
    }

    /// Read and parse one complete RESP value from the server.
    pub async fn read_response(&mut self) -> Result<RespValue> {
        loop {
            if !self.buf.is_empty() {
                // Freeze the buffered bytes so bulk strings slice zero-copy;
                // unconsumed trailing bytes are put back afterwards.
                let snapshot = self.buf.split().freeze();
                match parse(&snapshot) {
                    Ok((value, consumed)) => {
                        if consumed < snapshot.len() {
                            self.buf.extend_from_slice(&snapshot[consumed..]);
                        }
                        self.last_used = Instant::now();
                        return Ok(value);
                    }
                    Err(Error::Incomplete) => {
                        self.buf.extend_from_slice(&snapshot);
                    }
                    Err(e) => {
                        self.buf.extend_from_slice(&snapshot);
                        return Err(e);
                    }
                }
            }

            if self.buf.len() >= self.max_buf_size {
                return Err(Error::Protocol(format!(
                    "RESP message larger than {} bytes",
                    self.max_buf_size
                )));
            }
            let n = match self.read_timeout {
                Some(dur) => tokio::time::timeout(dur, self.stream.read_buf(&mut self.buf))
                    .await
                    .map_err(|_| Error::Timeout(format!("read timed out after {dur:?}")))??,
                None => self.stream.read_buf(&mut self.buf).await?,
            };
            if n == 0 {
                return Err(Error::Connection(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )));
            }
        }
    }

    /// Send one command and read its reply.
    pub async fn execute_str(&mut self, args: &[&str]) -> Result<RespValue> {
        let cmd = encode_command_str(args);
        self.send_raw(&cmd).await?;
        self.read_response().await
    }

    /// AUTH handshake. An error reply is fatal and never treated as
    /// transient by callers.
    pub async fn auth(&mut self, username: Option<&str>, password: &str) -> Result<()> {
        let response = match username {
            Some(user) => self.execute_str(&["AUTH", user, password]).await?,
            None => self.execute_str(&["AUTH", password]).await?,
        };
        match response {
            RespValue::SimpleString(ref s) if s == "OK" => Ok(()),
            RespValue::Error(msg) => Err(Error::Auth(msg)),
            other => Err(Error::Protocol(format!(
                "unexpected AUTH response: {}",
                other.type_name()
            ))),
        }
    }

    /// READONLY handshake, required before reading from a replica.
    pub async fn readonly(&mut self) -> Result<()> {
        self.expect_ok("READONLY").await
    }

    /// ASKING handshake, required before an ASK-directed retry.
    pub async fn asking(&mut self) -> Result<()> {
        self.expect_ok("ASKING").await
    }

    async fn expect_ok(&mut self, cmd: &str) -> Result<()> {
        match self.execute_str(&[cmd]).await? {
            RespValue::SimpleString(ref s) if s == "OK" => Ok(()),
            RespValue::Error(msg) => Err(Error::redis(msg)),
            other => Err(Error::Protocol(format!(
                "unexpected {cmd} response: {}",
                other.type_name()
            ))),
        }
    }
}
