use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;

use crate::passway::{config::TlsConfig, endpoint::Endpoint, tunnel::tls};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("dial {addr}: timed out after {}", humantime::format_duration(*.timeout))]
    Timeout { addr: String, timeout: Duration },
    #[error("dial {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("tls: invalid server name {0:?}")]
    ServerName(String),
    #[error("tls: handshake with {addr}: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// TCP connect bounded by `timeout`, with Nagle disabled.
pub async fn dial_tcp(ep: &Endpoint, timeout: Duration) -> Result<TcpStream, DialError> {
    let addr = ep.to_string();
    let conn = tokio::time::timeout(timeout, TcpStream::connect((ep.host(), ep.port())))
        .await
        .map_err(|_| DialError::Timeout {
            addr: addr.clone(),
            timeout,
        })?
        .map_err(|source| DialError::Connect { addr, source })?;
    let _ = conn.set_nodelay(true);
    Ok(conn)
}

/// Opens the control channel to the tunnel peer.
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn connect(&self, tunnel: &Endpoint) -> Result<BoxedStream, DialError>;
}

pub struct TlsTunnelConnector {
    connector: tokio_rustls::TlsConnector,
    server_name: Option<String>,
    insecure: bool,
    dial_timeout: Duration,
}

impl TlsTunnelConnector {
    pub fn new(cfg: &TlsConfig, dial_timeout: Duration) -> Result<Self, tls::TlsError> {
        let client_cfg = tls::client_config(&cfg.verification)?;
        Ok(Self {
            connector: tokio_rustls::TlsConnector::from(Arc::new(client_cfg)),
            server_name: cfg.server_name.clone(),
            insecure: tls::is_insecure(&cfg.verification),
            dial_timeout,
        })
    }
}

#[async_trait]
impl TunnelConnector for TlsTunnelConnector {
    async fn connect(&self, tunnel: &Endpoint) -> Result<BoxedStream, DialError> {
        let name = self
            .server_name
            .clone()
            .unwrap_or_else(|| tunnel.host().to_string());
        let server_name =
            ServerName::try_from(name.clone()).map_err(|_| DialError::ServerName(name))?;

        if self.insecure {
            tracing::warn!(tunnel = %tunnel, "tls: certificate verification disabled (insecure=1)");
        }

        let tcp = dial_tcp(tunnel, self.dial_timeout).await?;
        let addr = tunnel.to_string();
        let handshake = self.connector.connect(server_name, tcp);
        let tls = tokio::time::timeout(self.dial_timeout, handshake)
            .await
            .map_err(|_| DialError::Timeout {
                addr: addr.clone(),
                timeout: self.dial_timeout,
            })?
            .map_err(|source| DialError::Handshake { addr, source })?;
        Ok(Box::new(tls))
    }
}
