//! Per-session forwarding.
//!
//! TCP sessions bridge one pooled connection to one target connection for as
//! long as both stay open. UDP sessions carry exactly one request/response: the
//! pooled connection delivers one datagram, the target's single reply is written
//! back, and both sides are closed.

use std::{io, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UdpSocket,
};
use tokio_util::sync::CancellationToken;

use crate::passway::{
    endpoint::Endpoint,
    net,
    telemetry,
    tunnel::{
        exchange::{Exchange, ExchangeOutcome},
        pool::ConnectionPool,
        signal::SessionId,
        transport::{BoxedStream, DialError, dial_tcp},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Tcp,
    Udp,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Tcp => "tcp",
            SessionKind::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwardOptions {
    pub target: Endpoint,
    pub dial_timeout: Duration,
    pub udp_buffer_size: usize,
    pub udp_read_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("forward: no pooled connection for session {0}")]
    PoolMiss(SessionId),
    #[error("forward: target {0}")]
    TargetDial(#[from] DialError),
    #[error("forward: udp target {addr}: {source}")]
    UdpTarget {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("forward: read request from pooled connection: {0}")]
    PooledRead(#[source] io::Error),
    #[error("forward: pooled connection closed before delivering a request")]
    PooledClosed,
    #[error("forward: send to udp target: {0}")]
    UdpSend(#[source] io::Error),
    #[error("forward: no udp reply within {}", humantime::format_duration(*.0))]
    UdpTimeout(Duration),
    #[error("forward: receive from udp target: {0}")]
    UdpRecv(#[source] io::Error),
    #[error("forward: write reply to pooled connection: {0}")]
    PooledWrite(#[source] io::Error),
    #[error("forward: cancelled")]
    Cancelled,
}

pub struct Forwarder {
    pool: Arc<dyn ConnectionPool>,
    exchange: Arc<dyn Exchange>,
    opts: ForwardOptions,
}

impl Forwarder {
    pub fn new(
        pool: Arc<dyn ConnectionPool>,
        exchange: Arc<dyn Exchange>,
        opts: ForwardOptions,
    ) -> Self {
        Self {
            pool,
            exchange,
            opts,
        }
    }

    /// Run one session to completion and log how it ended. Errors stay here;
    /// nothing a single session does can affect another one.
    pub async fn run(&self, kind: SessionKind, id: SessionId, cancel: CancellationToken) {
        metrics::counter!(telemetry::SESSIONS, "proto" => kind.as_str()).increment(1);

        let res = match kind {
            SessionKind::Tcp => self.tcp_once(&id, &cancel).await.map(|outcome| {
                tracing::debug!(
                    session = %id,
                    to_target = outcome.to_target,
                    to_tunnel = outcome.to_tunnel,
                    err = ?outcome.error,
                    normal = outcome.is_normal_close(),
                    "forward: tcp exchange complete"
                );
            }),
            SessionKind::Udp => self.udp_once(&id, &cancel).await.map(|n| {
                tracing::debug!(session = %id, reply_bytes = n, "forward: udp transfer complete");
            }),
        };

        match res {
            Ok(()) => {}
            Err(ForwardError::Cancelled) => {
                tracing::debug!(session = %id, proto = kind.as_str(), "forward: cancelled by shutdown");
            }
            Err(err) => {
                metrics::counter!(telemetry::SESSION_FAILURES, "proto" => kind.as_str())
                    .increment(1);
                tracing::warn!(session = %id, proto = kind.as_str(), err = %err, "forward: session failed");
            }
        }
    }

    fn acquire(&self, id: &SessionId) -> Result<BoxedStream, ForwardError> {
        let conn = self
            .pool
            .acquire(id)
            .ok_or_else(|| ForwardError::PoolMiss(id.clone()))?;
        tracing::debug!(
            session = %id,
            active = self.pool.active(),
            capacity = self.pool.capacity(),
            "forward: pooled connection acquired"
        );
        Ok(conn)
    }

    /// Bridge the pooled connection for `id` to a fresh target connection.
    ///
    /// Both connections are owned by this call and dropped (closed) on every
    /// return path, including cancellation mid-exchange.
    pub async fn tcp_once(
        &self,
        id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<ExchangeOutcome, ForwardError> {
        let mut pooled = self.acquire(id)?;

        let mut target = tokio::select! {
            _ = cancel.cancelled() => return Err(ForwardError::Cancelled),
            conn = dial_tcp(&self.opts.target, self.opts.dial_timeout) => conn?,
        };
        tracing::debug!(session = %id, target = %self.opts.target, "forward: target connected");

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(ForwardError::Cancelled),
            outcome = self.exchange.bridge(&mut *pooled, &mut target) => outcome,
        };
        Ok(outcome)
    }

    /// Relay one datagram from the pooled connection for `id` to the target and
    /// the target's single reply back. Returns the reply size.
    ///
    /// On a missing reply nothing is written back; the pooled connection is
    /// just closed.
    pub async fn udp_once(
        &self,
        id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<usize, ForwardError> {
        let mut pooled = self.acquire(id)?;
        let mut buf = vec![0u8; self.opts.udp_buffer_size.max(1)];

        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(ForwardError::Cancelled),
            n = pooled.read(&mut buf) => n.map_err(ForwardError::PooledRead)?,
        };
        if n == 0 {
            return Err(ForwardError::PooledClosed);
        }

        let sock = tokio::select! {
            _ = cancel.cancelled() => return Err(ForwardError::Cancelled),
            sock = self.connect_udp() => sock?,
        };
        sock.send(&buf[..n]).await.map_err(ForwardError::UdpSend)?;

        let wait = self.opts.udp_read_timeout;
        let m = tokio::select! {
            _ = cancel.cancelled() => return Err(ForwardError::Cancelled),
            r = tokio::time::timeout(wait, sock.recv(&mut buf)) => r
                .map_err(|_| ForwardError::UdpTimeout(wait))?
                .map_err(ForwardError::UdpRecv)?,
        };

        pooled
            .write_all(&buf[..m])
            .await
            .map_err(ForwardError::PooledWrite)?;
        pooled.flush().await.map_err(ForwardError::PooledWrite)?;
        Ok(m)
    }

    async fn connect_udp(&self) -> Result<UdpSocket, ForwardError> {
        let addr = self.opts.target.to_string();
        let err = |source| ForwardError::UdpTarget {
            addr: addr.clone(),
            source,
        };

        let peer = net::resolve_socket_addr(&addr).await.map_err(err)?;
        let sock = UdpSocket::bind(net::unspecified_for(&peer))
            .await
            .map_err(err)?;
        sock.connect(peer).await.map_err(err)?;
        Ok(sock)
    }
}
