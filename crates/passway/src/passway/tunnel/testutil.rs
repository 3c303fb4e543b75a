//! Deterministic fakes and loopback peers shared by the tunnel tests.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::passway::{
    endpoint::Endpoint,
    tunnel::{
        exchange::{Exchange, ExchangeOutcome},
        pool::ConnectionPool,
        signal::SessionId,
        transport::{AsyncStream, BoxedStream, DialError, TunnelConnector},
    },
};

/// Pool backed by a map the test fills; records every acquisition attempt.
#[derive(Default)]
pub struct FakePool {
    conns: Mutex<HashMap<SessionId, BoxedStream>>,
    acquired: Mutex<Vec<String>>,
    closes: AtomicUsize,
    manages: AtomicUsize,
}

impl FakePool {
    pub fn insert<S>(&self, id: &str, stream: S)
    where
        S: AsyncStream + Unpin + Send + 'static,
    {
        self.conns
            .lock()
            .unwrap()
            .insert(SessionId::new(id), Box::new(stream));
    }

    pub fn acquired(&self) -> Vec<String> {
        self.acquired.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn manages(&self) -> usize {
        self.manages.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionPool for FakePool {
    fn acquire(&self, id: &SessionId) -> Option<BoxedStream> {
        self.acquired.lock().unwrap().push(id.to_string());
        self.conns.lock().unwrap().remove(id)
    }

    fn active(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    fn capacity(&self) -> usize {
        self.active()
    }

    async fn manage(&self, cancel: CancellationToken) {
        self.manages.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.conns.lock().unwrap().clear();
    }
}

/// Hands out one pre-made control stream, then refuses.
pub struct FakeConnector {
    stream: Mutex<Option<BoxedStream>>,
}

impl FakeConnector {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncStream + Unpin + Send + 'static,
    {
        Self {
            stream: Mutex::new(Some(Box::new(stream))),
        }
    }

    pub fn refusing() -> Self {
        Self {
            stream: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TunnelConnector for FakeConnector {
    async fn connect(&self, tunnel: &Endpoint) -> Result<BoxedStream, DialError> {
        self.stream
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| DialError::Connect {
                addr: tunnel.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            })
    }
}

/// Exchange that returns immediately without copying anything.
pub struct NoopExchange;

#[async_trait]
impl Exchange for NoopExchange {
    async fn bridge(
        &self,
        _pooled: &mut (dyn AsyncStream + Unpin + Send),
        _target: &mut (dyn AsyncStream + Unpin + Send),
    ) -> ExchangeOutcome {
        ExchangeOutcome::default()
    }
}

/// TCP target echoing everything back; counts accepted connections.
pub async fn spawn_tcp_echo() -> (SocketAddr, Arc<AtomicUsize>, JoinHandle<()>) {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = accepted.clone();
    let task = tokio::spawn(async move {
        while let Ok((mut c, _)) = ln.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match c.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if c.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    (addr, accepted, task)
}

/// Data-connection peer: writes ids `<prefix>0000001`, `<prefix>0000002`, ...
/// on each accepted connection and keeps the connections open.
pub async fn spawn_id_server(prefix: char) -> (u16, JoinHandle<()>) {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = ln.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let mut n = 0u32;
        let mut held = Vec::new();
        while let Ok((mut c, _)) = ln.accept().await {
            n += 1;
            let id = format!("{prefix}{n:07}");
            let _ = c.write_all(id.as_bytes()).await;
            held.push(c);
        }
    });
    (port, task)
}

/// UDP target answering each datagram with `reply(payload)`, or staying silent
/// when it returns `None`.
pub async fn spawn_udp_responder(
    reply: fn(&[u8]) -> Option<Vec<u8>>,
) -> (SocketAddr, JoinHandle<()>) {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = sock.recv_from(&mut buf).await {
            if let Some(out) = reply(&buf[..n]) {
                let _ = sock.send_to(&out, from).await;
            }
        }
    });
    (addr, task)
}

/// TLS server with a throwaway self-signed certificate that writes `payload`
/// to every client and then closes cleanly.
pub async fn spawn_tls_line_server(payload: Vec<u8>) -> (SocketAddr, JoinHandle<()>) {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(["localhost".to_string()]).unwrap();
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));

    let cfg = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert_der], key_der)
    .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(cfg));

    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap();
    let task = tokio::spawn(async move {
        while let Ok((c, _)) = ln.accept().await {
            let acceptor = acceptor.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Ok(mut tls) = acceptor.accept(c).await {
                    let _ = tls.write_all(&payload).await;
                    let _ = tls.shutdown().await;
                }
            });
        }
    });
    (addr, task)
}
