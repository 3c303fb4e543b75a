use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::passway::tunnel::transport::AsyncStream;

/// How a bridged session ended.
#[derive(Debug, Default)]
pub struct ExchangeOutcome {
    /// Bytes copied from the pooled connection to the target.
    pub to_target: u64,
    /// Bytes copied from the target back to the pooled connection.
    pub to_tunnel: u64,
    /// The error that ended the exchange, if it was not a clean close.
    pub error: Option<io::Error>,
}

impl ExchangeOutcome {
    /// EOF and resets are how sessions normally end; anything else is worth a
    /// closer look in the logs.
    pub fn is_normal_close(&self) -> bool {
        match &self.error {
            None => true,
            Some(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
        }
    }
}

/// Bidirectional byte copy between a pooled connection and a target.
///
/// Implementations return once either side closes or errors. Both connections
/// stay owned by the caller, which closes them afterwards.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn bridge(
        &self,
        pooled: &mut (dyn AsyncStream + Unpin + Send),
        target: &mut (dyn AsyncStream + Unpin + Send),
    ) -> ExchangeOutcome;
}

const COPY_BUF_SIZE: usize = 16 * 1024;

/// [`Exchange`] that pumps both directions concurrently and ends the session
/// as soon as one of them reaches EOF or fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyExchange;

#[async_trait]
impl Exchange for CopyExchange {
    async fn bridge(
        &self,
        pooled: &mut (dyn AsyncStream + Unpin + Send),
        target: &mut (dyn AsyncStream + Unpin + Send),
    ) -> ExchangeOutcome {
        let (pooled_rd, pooled_wr) = tokio::io::split(pooled);
        let (target_rd, target_wr) = tokio::io::split(target);
        let to_target = AtomicU64::new(0);
        let to_tunnel = AtomicU64::new(0);

        let res = tokio::select! {
            res = pump(pooled_rd, target_wr, &to_target) => res,
            res = pump(target_rd, pooled_wr, &to_tunnel) => res,
        };

        ExchangeOutcome {
            to_target: to_target.into_inner(),
            to_tunnel: to_tunnel.into_inner(),
            error: res.err(),
        }
    }
}

/// Copy `rd` into `wr` until EOF, counting delivered bytes into `moved`.
async fn pump<R, W>(mut rd: R, mut wr: W, moved: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        wr.write_all(&buf[..n]).await?;
        wr.flush().await?;
        moved.fetch_add(n as u64, Ordering::Relaxed);
    }
}
