//! Pre-dialed data connections, claimed once by session id.
//!
//! The tunnel peer announces an id on every data connection it accepts and later
//! names that id in a `tcp://` or `udp://` signal. Acquisition never waits: a
//! session whose connection is not (or no longer) pooled is simply lost.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{io::AsyncReadExt, net::TcpStream};
use tokio_util::sync::CancellationToken;

use crate::passway::{
    endpoint::DataDialAddr,
    telemetry,
    tunnel::{
        signal::SessionId,
        transport::{BoxedStream, DialError, dial_tcp},
    },
};

/// Length of the id token the peer writes on each new data connection.
pub const POOL_ID_LEN: usize = 8;

#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Remove and return the connection registered under `id`.
    fn acquire(&self, id: &SessionId) -> Option<BoxedStream>;
    /// Idle connections currently held.
    fn active(&self) -> usize;
    /// Current target number of idle connections.
    fn capacity(&self) -> usize;
    /// Background warm-up loop; returns once `cancel` fires or the pool closes.
    async fn manage(&self, cancel: CancellationToken);
    /// Drop every pooled connection and stop dialing. Idempotent.
    fn close(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum PoolDialError {
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("pool: read session id from {addr}: {source}")]
    ReadId {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("pool: timed out waiting for session id from {0}")]
    IdTimeout(String),
    #[error("pool: invalid session id {0:?}")]
    BadId(String),
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub interval: Duration,
    pub dial_timeout: Duration,
}

/// [`ConnectionPool`] of TCP connections dialed to the tunnel host at the
/// current data-dial port.
pub struct TcpClientPool {
    addr: Arc<DataDialAddr>,
    opts: PoolOptions,
    conns: DashMap<SessionId, TcpStream>,
    capacity: AtomicUsize,
    closed: AtomicBool,
    dial_errors: AtomicU64,
}

impl std::fmt::Debug for TcpClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClientPool")
            .field("addr", &self.addr)
            .field("active", &self.conns.len())
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

impl TcpClientPool {
    pub fn new(addr: Arc<DataDialAddr>, mut opts: PoolOptions) -> Self {
        opts.min_capacity = opts.min_capacity.max(1);
        opts.max_capacity = opts.max_capacity.max(opts.min_capacity);
        Self {
            addr,
            capacity: AtomicUsize::new(opts.min_capacity),
            opts,
            conns: DashMap::new(),
            closed: AtomicBool::new(false),
            dial_errors: AtomicU64::new(0),
        }
    }

    pub fn dial_errors(&self) -> u64 {
        self.dial_errors.load(Ordering::Relaxed)
    }

    /// Dial one data connection and read the id the peer assigns to it.
    ///
    /// The data-dial port is read here, once, so a later `remote://` signal
    /// never affects a connection that is already established.
    async fn dial_one(&self) -> Result<(SessionId, TcpStream), PoolDialError> {
        let ep = self.addr.endpoint();
        let mut conn = dial_tcp(&ep, self.opts.dial_timeout).await?;

        let mut id = [0u8; POOL_ID_LEN];
        tokio::time::timeout(self.opts.dial_timeout, conn.read_exact(&mut id))
            .await
            .map_err(|_| PoolDialError::IdTimeout(ep.to_string()))?
            .map_err(|source| PoolDialError::ReadId {
                addr: ep.to_string(),
                source,
            })?;

        let id = String::from_utf8_lossy(&id).trim().to_string();
        if id.is_empty() || id.chars().any(char::is_control) {
            return Err(PoolDialError::BadId(id));
        }
        Ok((SessionId::new(id), conn))
    }

    /// Dial the missing connections in parallel and register the ones that
    /// made it.
    async fn fill(&self) {
        let missing = self.capacity().saturating_sub(self.active());
        if missing == 0 {
            return;
        }

        let dials = (0..missing).map(|_| self.dial_one());
        for res in futures_util::future::join_all(dials).await {
            match res {
                Ok((id, conn)) => {
                    if self.closed.load(Ordering::Acquire) {
                        return;
                    }
                    if self.conns.insert(id.clone(), conn).is_some() {
                        tracing::debug!(session = %id, "pool: duplicate id replaced older connection");
                    }
                }
                Err(err) => {
                    self.dial_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(err = %err, "pool: dial failed");
                }
            }
        }
        metrics::gauge!(telemetry::POOL_ACTIVE).set(self.active() as f64);
    }

    fn adjust_capacity(&self, idle_before_fill: usize) {
        let cur = self.capacity();
        let next = next_capacity(
            cur,
            idle_before_fill,
            self.opts.min_capacity,
            self.opts.max_capacity,
        );
        if next != cur {
            tracing::debug!(from = cur, to = next, idle = idle_before_fill, "pool: capacity adjusted");
            self.capacity.store(next, Ordering::Relaxed);
        }
    }
}

/// Capacity for the next tick given how many idle connections survived the
/// last one: grow when demand drained the pool, shrink when it sat unused.
pub fn next_capacity(cur: usize, idle: usize, min: usize, max: usize) -> usize {
    if idle * 5 < cur {
        (cur * 2).clamp(min, max)
    } else if idle * 5 > cur * 4 {
        (cur / 2).clamp(min, max)
    } else {
        cur
    }
}

#[async_trait]
impl ConnectionPool for TcpClientPool {
    fn acquire(&self, id: &SessionId) -> Option<BoxedStream> {
        let (_, conn) = self.conns.remove(id)?;
        Some(Box::new(conn))
    }

    fn active(&self) -> usize {
        self.conns.len()
    }

    fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    async fn manage(&self, cancel: CancellationToken) {
        tracing::debug!(
            addr = %self.addr.endpoint(),
            min = self.opts.min_capacity,
            max = self.opts.max_capacity,
            "pool: manager started"
        );

        let mut first = true;
        loop {
            if self.closed.load(Ordering::Acquire) || cancel.is_cancelled() {
                break;
            }

            let idle = self.active();
            if !first {
                self.adjust_capacity(idle);
            }
            first = false;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.fill() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.opts.interval) => {}
            }
        }

        tracing::debug!("pool: manager stopped");
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.conns.clear();
        metrics::gauge!(telemetry::POOL_ACTIVE).set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::passway::{endpoint::Endpoint, tunnel::testutil::spawn_id_server};

    fn opts(min: usize, max: usize) -> PoolOptions {
        PoolOptions {
            min_capacity: min,
            max_capacity: max,
            interval: Duration::from_millis(20),
            dial_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn capacity_grows_and_shrinks_within_bounds() {
        assert_eq!(next_capacity(16, 0, 16, 1024), 32);
        assert_eq!(next_capacity(512, 10, 16, 1024), 1024);
        assert_eq!(next_capacity(1024, 0, 16, 1024), 1024);
        assert_eq!(next_capacity(64, 64, 16, 1024), 32);
        assert_eq!(next_capacity(16, 16, 16, 1024), 16);
        assert_eq!(next_capacity(32, 16, 16, 1024), 32);
    }

    #[tokio::test]
    async fn fill_registers_connections_by_announced_id() {
        let (port, server) = spawn_id_server('a').await;
        let addr = Arc::new(DataDialAddr::new(&Endpoint::new("127.0.0.1", port)));
        let pool = TcpClientPool::new(addr, opts(3, 3));

        pool.fill().await;
        assert_eq!(pool.active(), 3);
        assert_eq!(pool.capacity(), 3);

        let id = SessionId::new("a0000002");
        assert!(pool.acquire(&id).is_some());
        // Acquisition is exclusive: a second claim on the same id misses.
        assert!(pool.acquire(&id).is_none());
        assert!(pool.acquire(&SessionId::new("missing!")).is_none());
        assert_eq!(pool.active(), 2);

        pool.close();
        pool.close();
        assert_eq!(pool.active(), 0);
        server.abort();
    }

    #[tokio::test]
    async fn port_change_applies_to_new_dials_only() {
        let (old_port, old_server) = spawn_id_server('o').await;
        let (new_port, new_server) = spawn_id_server('n').await;
        let addr = Arc::new(DataDialAddr::new(&Endpoint::new("127.0.0.1", old_port)));
        let pool = TcpClientPool::new(addr.clone(), opts(2, 2));

        pool.fill().await;
        assert!(pool.conns.contains_key(&SessionId::new("o0000001")));

        addr.set_port(new_port);
        // One slot frees up; the refill goes to the new port.
        assert!(pool.acquire(&SessionId::new("o0000001")).is_some());
        pool.fill().await;

        assert!(pool.conns.contains_key(&SessionId::new("o0000002")));
        assert!(pool.conns.contains_key(&SessionId::new("n0000001")));
        assert_eq!(pool.active(), 2);

        old_server.abort();
        new_server.abort();
    }

    #[tokio::test]
    async fn manage_warms_up_and_stops_on_cancel() {
        let (port, server) = spawn_id_server('m').await;
        let addr = Arc::new(DataDialAddr::new(&Endpoint::new("127.0.0.1", port)));
        let pool = Arc::new(TcpClientPool::new(addr, opts(4, 8)));
        let cancel = CancellationToken::new();

        let p = pool.clone();
        let c = cancel.clone();
        let mgr = tokio::spawn(async move { p.manage(c).await });

        for _ in 0..100 {
            if pool.active() >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pool.active() >= 4);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), mgr)
            .await
            .expect("manager must stop on cancel")
            .unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn dial_failures_are_counted_not_fatal() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        drop(ln);

        let addr = Arc::new(DataDialAddr::new(&Endpoint::new("127.0.0.1", port)));
        let pool = TcpClientPool::new(addr, opts(2, 2));
        pool.fill().await;
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.dial_errors(), 2);
    }
}
