//! Tunnel and target endpoints.
//!
//! A client URL looks like `client://<tunnel host:port>/<target host:port>?...`:
//! the authority names the tunnel peer (control channel and pooled data
//! connections), the path names the local target that forwarded traffic
//! terminates at.

use std::{
    fmt,
    sync::atomic::{AtomicU16, Ordering},
};

use url::Url;

use crate::passway::config::ConfigError;

/// Host used when an address omits the host part (`:9000`).
const LOCAL_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, `[v6]:port` or `:port`.
    pub fn parse(what: &'static str, raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let err = |reason: &'static str| ConfigError::Endpoint {
            what,
            addr: raw.to_string(),
            reason,
        };

        let (host, port) = raw.rsplit_once(':').ok_or_else(|| err("missing port"))?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| err("unterminated IPv6 bracket"))?,
            None if host.contains(':') => return Err(err("IPv6 host must be bracketed")),
            None => host,
        };
        if host.contains(['/', '[', ']']) || host.chars().any(char::is_whitespace) {
            return Err(err("invalid host"));
        }

        let port: u16 = port.parse().map_err(|_| err("invalid port"))?;
        if port == 0 {
            return Err(err("port must be non-zero"));
        }

        let host = if host.is_empty() { LOCAL_HOST } else { host };
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.host.clone(), port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub tunnel: Endpoint,
    pub target: Endpoint,
}

/// Extract the tunnel endpoint (authority) and the target endpoint (path).
pub fn resolve(url: &Url) -> Result<Endpoints, ConfigError> {
    let host = url.host_str().unwrap_or_default();
    let tunnel = match url.port() {
        Some(port) => Endpoint::parse("tunnel", &format!("{host}:{port}"))?,
        None => {
            return Err(ConfigError::Endpoint {
                what: "tunnel",
                addr: host.to_string(),
                reason: "missing port",
            });
        }
    };

    let target = Endpoint::parse("target", url.path().trim_start_matches('/'))?;
    Ok(Endpoints { tunnel, target })
}

/// The tunnel address new pooled connections are dialed to.
///
/// The host is fixed; the port follows `remote://<port>` control signals and is
/// read once per dial, so connections already pooled keep the port they were
/// dialed with.
#[derive(Debug)]
pub struct DataDialAddr {
    host: String,
    port: AtomicU16,
}

impl DataDialAddr {
    pub fn new(tunnel: &Endpoint) -> Self {
        Self {
            host: tunnel.host().to_string(),
            port: AtomicU16::new(tunnel.port()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    /// Returns the previous port.
    pub fn set_port(&self, port: u16) -> u16 {
        self.port.swap(port, Ordering::AcqRel)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_tunnel_and_target() {
        let url = Url::parse("client://tunnel.example.com:10101/127.0.0.1:8080?log=debug").unwrap();
        let eps = resolve(&url).unwrap();
        assert_eq!(eps.tunnel, Endpoint::new("tunnel.example.com", 10101));
        assert_eq!(eps.target, Endpoint::new("127.0.0.1", 8080));
    }

    #[test]
    fn resolve_ipv6_hosts() {
        let url = Url::parse("client://[::1]:10101/[::1]:8080").unwrap();
        let eps = resolve(&url).unwrap();
        assert_eq!(eps.tunnel.host(), "::1");
        assert_eq!(eps.tunnel.to_string(), "[::1]:10101");
        assert_eq!(eps.target.host(), "::1");
        assert_eq!(eps.target.to_string(), "[::1]:8080");
    }

    #[test]
    fn resolve_rejects_missing_ports() {
        let url = Url::parse("client://tunnel.example.com/127.0.0.1:8080").unwrap();
        let err = resolve(&url).unwrap_err();
        assert!(err.to_string().contains("tunnel"), "{err}");

        let url = Url::parse("client://tunnel.example.com:10101/127.0.0.1").unwrap();
        let err = resolve(&url).unwrap_err();
        assert!(err.to_string().contains("target"), "{err}");

        let url = Url::parse("client://tunnel.example.com:10101").unwrap();
        assert!(resolve(&url).is_err());
    }

    #[test]
    fn parse_rejects_bad_ports_and_hosts() {
        assert!(Endpoint::parse("target", "host:abc").is_err());
        assert!(Endpoint::parse("target", "host:70000").is_err());
        assert!(Endpoint::parse("target", "host:0").is_err());
        assert!(Endpoint::parse("target", "::1:80").is_err());
        assert!(Endpoint::parse("target", "[::1:80").is_err());
        assert!(Endpoint::parse("target", "a/b:80").is_err());
    }

    #[test]
    fn parse_port_only_means_local() {
        let ep = Endpoint::parse("target", " :9000 ").unwrap();
        assert_eq!(ep, Endpoint::new("127.0.0.1", 9000));
    }

    #[test]
    fn data_dial_port_is_swappable() {
        let addr = DataDialAddr::new(&Endpoint::new("tunnel.example.com", 10101));
        assert_eq!(addr.endpoint().to_string(), "tunnel.example.com:10101");

        assert_eq!(addr.set_port(9100), 10101);
        assert_eq!(addr.port(), 9100);
        assert_eq!(addr.endpoint().to_string(), "tunnel.example.com:9100");
    }
}
