//! Control signals and the bounded queue between the control-channel reader
//! and the dispatcher.
//!
//! Wire form is one line per signal: `remote://<port>`, `tcp://<session id>`,
//! `udp://<session id>`. Unknown schemes decode to [`Signal::Unknown`] so newer
//! peers can add signals without breaking older clients.

use std::{fmt, num::ParseIntError, str::FromStr};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::passway::config::DropPolicy;

/// Opaque id correlating a session signal with a pooled data connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    SetRemotePort(u16),
    OpenTcpSession(SessionId),
    OpenUdpSession(SessionId),
    Unknown { scheme: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("signal: expected scheme://value, got {0:?}")]
    Malformed(String),
    #[error("signal: invalid remote port {value:?}: {source}")]
    BadPort {
        value: String,
        source: ParseIntError,
    },
    #[error("signal: remote port must be non-zero")]
    ZeroPort,
    #[error("signal: empty session id in {0}://")]
    EmptySessionId(&'static str),
}

impl FromStr for Signal {
    type Err = SignalError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (scheme, value) = line
            .split_once("://")
            .filter(|(scheme, _)| !scheme.is_empty())
            .ok_or_else(|| SignalError::Malformed(line.to_string()))?;
        let value = value.trim();

        match scheme.to_ascii_lowercase().as_str() {
            "remote" => {
                let port: u16 = value.parse().map_err(|source| SignalError::BadPort {
                    value: value.to_string(),
                    source,
                })?;
                if port == 0 {
                    return Err(SignalError::ZeroPort);
                }
                Ok(Signal::SetRemotePort(port))
            }
            "tcp" => session_id("tcp", value).map(Signal::OpenTcpSession),
            "udp" => session_id("udp", value).map(Signal::OpenUdpSession),
            other => Ok(Signal::Unknown {
                scheme: other.to_string(),
            }),
        }
    }
}

fn session_id(scheme: &'static str, value: &str) -> Result<SessionId, SignalError> {
    if value.is_empty() {
        return Err(SignalError::EmptySessionId(scheme));
    }
    Ok(SessionId::new(value))
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::SetRemotePort(port) => write!(f, "remote://{port}"),
            Signal::OpenTcpSession(id) => write!(f, "tcp://{id}"),
            Signal::OpenUdpSession(id) => write!(f, "udp://{id}"),
            Signal::Unknown { scheme } => write!(f, "{scheme}://"),
        }
    }
}

/// Result of offering a raw signal line to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// Queue full under [`DropPolicy::DropNewest`]; the line was discarded.
    Dropped,
    /// The dispatcher is gone; nothing will consume the line.
    Closed,
}

pub type SignalReceiver = mpsc::Receiver<String>;

#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<String>,
    policy: DropPolicy,
}

pub fn signal_queue(capacity: usize, policy: DropPolicy) -> (SignalSender, SignalReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (SignalSender { tx, policy }, rx)
}

impl SignalSender {
    pub async fn offer(&self, line: String) -> Offer {
        match self.policy {
            DropPolicy::DropNewest => match self.tx.try_send(line) {
                Ok(()) => Offer::Queued,
                Err(TrySendError::Full(_)) => Offer::Dropped,
                Err(TrySendError::Closed(_)) => Offer::Closed,
            },
            DropPolicy::Block => match self.tx.send(line).await {
                Ok(()) => Offer::Queued,
                Err(_) => Offer::Closed,
            },
        }
    }

    pub fn max_capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}
