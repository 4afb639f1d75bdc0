//! Per-node keepalive connection pool.
//!
//! Bounded by `keepalive_cons` with an idle TTL of `keepalive_timeout_ms`.
//! The idle queue sits behind a `parking_lot::Mutex` (held briefly, never
//! across I/O) so connections can be returned from `Drop` without async.
//!
//! Admission waits are bounded: a caller that cannot obtain a permit within
//! the connect timeout gets [`Error::PoolBusy`] — the routing layer treats
//! that as load pressure, never as a stale-topology signal.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::connection::tcp::RedisConnection;
use crate::error::{Error, Result};

/// Keepalive pool for one `ip:port`.
pub struct ConnectionPool {
    addr: String,
    idle: SyncMutex<VecDeque<RedisConnection>>,
    semaphore: Semaphore,
    config: Arc<ClusterConfig>,
    max_size: usize,
    idle_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(addr: String, config: Arc<ClusterConfig>) -> Self {
        let max_size = config.keepalive_cons.max(1);
        let idle_timeout = Duration::from_millis(config.keepalive_timeout_ms);
        Self {
            addr,
            idle: SyncMutex::new(VecDeque::new()),
            semaphore: Semaphore::new(max_size),
            config,
            max_size,
            idle_timeout,
        }
    }

    /// Address this pool serves.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Borrow a connection; fresh connections are authenticated before they
    /// are handed out. The guard releases back to the pool on drop.
    pub async fn get(&self) -> Result<PoolGuard<'_>> {
        let wait = Duration::from_millis(self.config.connect_timeout_ms);
        let permit = match tokio::time::timeout(wait, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(Error::Connection(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "pool semaphore closed",
                )))
            }
            Err(_) => return Err(Error::PoolBusy),
        };

        let reused = {
            let mut idle = self.idle.lock();
            self.pop_live_connection(&mut idle)
        };

        let conn = match reused {
            Some(mut conn) => {
                conn.mark_reused();
                conn
            }
            None => self.open_connection().await?,
        };

        Ok(PoolGuard {
            conn: Some(conn),
            pool: self,
            _permit: permit,
        })
    }

    /// Idle connections currently parked.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Free permits (roughly `max_size` minus checked-out connections).
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    async fn open_connection(&self) -> Result<RedisConnection> {
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let mut conn =
            RedisConnection::connect(&self.addr, connect_timeout, &self.config.connect_opts)
                .await?;
        conn.set_timeouts(
            Some(Duration::from_millis(self.config.send_timeout_ms)),
            Some(Duration::from_millis(self.config.read_timeout_ms)),
        );
        if let Some(password) = self.config.password.as_deref() {
            conn.auth(self.config.username.as_deref(), password).await?;
        }
        debug!(addr = %self.addr, "opened connection");
        Ok(conn)
    }

    /// Pop the freshest idle connection that has not expired.
    fn pop_live_connection(
        &self,
        idle: &mut VecDeque<RedisConnection>,
    ) -> Option<RedisConnection> {
        while let Some(conn) = idle.pop_back() {
            if conn.last_used.elapsed() > self.idle_timeout {
                continue;
            }
            return Some(conn);
        }
        None
    }

    /// Park a connection back into the keepalive set (sync, Drop-safe).
    fn release(&self, conn: RedisConnection) {
        if conn.last_used.elapsed() > self.idle_timeout {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_size {
            idle.push_back(conn);
        } else {
            warn!(addr = %self.addr, "keepalive pool full, dropping connection");
        }
    }
}

/// RAII guard over a borrowed connection.
pub struct PoolGuard<'a> {
    conn: Option<RedisConnection>,
    pool: &'a ConnectionPool,
    _permit: SemaphorePermit<'a>,
}

impl std::fmt::Debug for PoolGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").finish()
    }
}

impl PoolGuard<'_> {
    /// The underlying connection.
    pub fn conn(&mut self) -> &mut RedisConnection {
        self.conn.as_mut().expect("connection already taken")
    }

    /// Take the connection out of the guard; it will be closed instead of
    /// returned to the pool. Used when a node returns MOVED pointing at
    /// itself or fails mid-operation.
    pub fn discard(mut self) {
        drop(self.conn.take());
    }
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::types::RespValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Mock node that answers every command with +OK.
    async fn mock_node() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {
                                if socket.write_all(b"+OK\r\n").await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        addr
    }

    fn pool_config(keepalive_cons: usize) -> Arc<ClusterConfig> {
        Arc::new(ClusterConfig {
            name: "test".into(),
            keepalive_cons,
            connect_timeout_ms: 200,
            ..ClusterConfig::default()
        })
    }

    #[tokio::test]
    async fn get_and_release() {
        let addr = mock_node().await;
        let pool = ConnectionPool::new(addr, pool_config(3));

        assert_eq!(pool.available(), 3);
        {
            let mut guard = pool.get().await.unwrap();
            assert_eq!(pool.available(), 2);
            let reply = guard.conn().execute_str(&["PING"]).await.unwrap();
            assert_eq!(reply, RespValue::SimpleString("OK".into()));
        }
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn reuses_idle_connections() {
        let addr = mock_node().await;
        let pool = ConnectionPool::new(addr, pool_config(3));

        {
            let mut guard = pool.get().await.unwrap();
            guard.conn().execute_str(&["PING"]).await.unwrap();
        }
        assert_eq!(pool.idle_count(), 1);

        {
            let mut guard = pool.get().await.unwrap();
            assert_eq!(pool.idle_count(), 0);
            assert_eq!(guard.conn().reused(), 1);
        }
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn saturation_is_pool_busy() {
        let addr = mock_node().await;
        let pool = ConnectionPool::new(addr, pool_config(1));

        let _held = pool.get().await.unwrap();
        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, Error::PoolBusy));
    }

    #[tokio::test]
    async fn discard_closes_instead_of_pooling() {
        let addr = mock_node().await;
        let pool = ConnectionPool::new(addr, pool_config(2));

        let guard = pool.get().await.unwrap();
        guard.discard();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn idle_ttl_expires_connections() {
        let addr = mock_node().await;
        let config = Arc::new(ClusterConfig {
            name: "test".into(),
            keepalive_cons: 2,
            keepalive_timeout_ms: 30,
            connect_timeout_ms: 200,
            ..ClusterConfig::default()
        });
        let pool = ConnectionPool::new(addr, config);

        {
            let mut guard = pool.get().await.unwrap();
            guard.conn().execute_str(&["PING"]).await.unwrap();
        }
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        {
            let mut guard = pool.get().await.unwrap();
            // Expired idle connection was dropped; this one is fresh.
            assert_eq!(guard.conn().reused(), 0);
        }
    }

    #[tokio::test]
    async fn auth_runs_on_fresh_connections() {
        // Node that expects AUTH first.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let cmd = String::from_utf8_lossy(&buf[..n]).to_string();
            if cmd.contains("AUTH") {
                socket.write_all(b"+OK\r\n").await.unwrap();
            } else {
                socket.write_all(b"-NOAUTH Authentication required\r\n").await.unwrap();
            }
            let _ = socket.read(&mut buf).await;
            socket.write_all(b"+PONG\r\n").await.unwrap();
        });

        let config = Arc::new(ClusterConfig {
            name: "test".into(),
            password: Some("secret".into()),
            connect_timeout_ms: 200,
            ..ClusterConfig::default()
        });
        let pool = ConnectionPool::new(addr, config);
        let mut guard = pool.get().await.unwrap();
        let reply = guard.conn().execute_str(&["PING"]).await.unwrap();
        assert_eq!(reply, RespValue::SimpleString("PONG".into()));
    }

    #[tokio::test]
    async fn connect_failure_propagates() {
        let pool = ConnectionPool::new("127.0.0.1:1".into(), pool_config(1));
        assert!(pool.get().await.is_err());
    }
}
