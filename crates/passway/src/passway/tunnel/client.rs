use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::passway::{
    config::{TlsConfig, Tunables},
    endpoint::{DataDialAddr, Endpoints},
    tunnel::{
        channel::{self, ControlChannelError},
        dispatch::Dispatcher,
        exchange::{CopyExchange, Exchange},
        forward::{ForwardOptions, Forwarder},
        pool::{ConnectionPool, PoolOptions, TcpClientPool},
        signal::signal_queue,
        tasks::TaskGroup,
        tls::TlsError,
        transport::{DialError, TlsTunnelConnector, TunnelConnector},
    },
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub endpoints: Endpoints,
    pub tls: TlsConfig,
    pub tunables: Tunables,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("tunnel: connect control channel: {0}")]
    Dial(#[from] DialError),
    #[error(transparent)]
    Control(#[from] ControlChannelError),
    #[error("tunnel: client already started")]
    AlreadyStarted,
}

/// One run of the tunneling client.
///
/// `start` blocks for the lifetime of the control channel; `stop` and
/// `shutdown` may be called from any other task. A client is single-use: after
/// `start` returns, build a new one to reconnect.
pub struct Client {
    opts: ClientOptions,
    connector: Arc<dyn TunnelConnector>,
    pool: Arc<dyn ConnectionPool>,
    exchange: Arc<dyn Exchange>,
    data_addr: Arc<DataDialAddr>,
    tasks: TaskGroup,
    cancel: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Client {
    /// Client with the TLS control channel, the TCP connection pool and the
    /// copying exchange, all sharing one data-dial address.
    pub fn new(opts: ClientOptions) -> Result<Self, ClientError> {
        let t = &opts.tunables;
        let connector = TlsTunnelConnector::new(&opts.tls, t.dial_timeout)?;
        let data_addr = Arc::new(DataDialAddr::new(&opts.endpoints.tunnel));
        let pool = TcpClientPool::new(
            data_addr.clone(),
            PoolOptions {
                min_capacity: t.min_pool,
                max_capacity: t.max_pool,
                interval: t.pool_interval,
                dial_timeout: t.dial_timeout,
            },
        );

        Ok(Self::with_parts(
            opts,
            data_addr,
            Arc::new(connector),
            Arc::new(pool),
            Arc::new(CopyExchange),
        ))
    }

    /// Client over caller-supplied parts. `data_addr` is where `remote://`
    /// signals land; a pool that should follow them must dial from the same
    /// [`DataDialAddr`].
    pub fn with_parts(
        opts: ClientOptions,
        data_addr: Arc<DataDialAddr>,
        connector: Arc<dyn TunnelConnector>,
        pool: Arc<dyn ConnectionPool>,
        exchange: Arc<dyn Exchange>,
    ) -> Self {
        Self {
            opts,
            connector,
            pool,
            exchange,
            data_addr,
            tasks: TaskGroup::new(),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn data_dial_port(&self) -> u16 {
        self.data_addr.port()
    }

    /// Connect the control channel and serve signals until it fails or the
    /// client is stopped.
    ///
    /// Returns `Ok(())` only when stopped; a closed or broken channel is an
    /// error. Background work (dispatcher, pool manager, sessions) keeps
    /// running after an error until [`Client::stop`] or [`Client::shutdown`].
    pub async fn start(&self) -> Result<(), ClientError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ClientError::AlreadyStarted);
        }

        let ep = &self.opts.endpoints;
        let control = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            conn = self.connector.connect(&ep.tunnel) => conn?,
        };
        tracing::info!(tunnel = %ep.tunnel, target = %ep.target, "tunnel: connected");

        let t = &self.opts.tunables;
        let (queue, rx) = signal_queue(t.signal_queue, t.drop_policy);

        let pool = self.pool.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move { pool.manage(cancel).await });

        let forwarder = Forwarder::new(
            self.pool.clone(),
            self.exchange.clone(),
            ForwardOptions {
                target: ep.target.clone(),
                dial_timeout: t.dial_timeout,
                udp_buffer_size: t.udp_buffer_size,
                udp_read_timeout: t.udp_read_timeout,
            },
        );
        let dispatcher = Dispatcher::new(
            rx,
            self.data_addr.clone(),
            Arc::new(forwarder),
            self.tasks.clone(),
            self.cancel.clone(),
        );
        self.tasks.spawn(async move {
            dispatcher.run().await;
        });

        match channel::read_loop(control, &queue, &self.cancel).await {
            Ok(()) => {
                tracing::debug!(tunnel = %ep.tunnel, "tunnel: control channel released");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(tunnel = %ep.tunnel, err = %err, "tunnel: control channel failed");
                Err(err.into())
            }
        }
    }

    /// Cancel everything started by [`Client::start`] and release the pool.
    /// Safe to call before `start` and more than once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.pool.close();
        tracing::debug!(tunnel = %self.opts.endpoints.tunnel, "tunnel: client stopped");
    }

    /// [`Client::stop`], then wait up to `grace` for background tasks.
    /// Returns how many had to be aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.stop();
        let aborted = self.tasks.drain(grace).await;
        tracing::info!(aborted, "tunnel: shutdown complete");
        aborted
    }
}
