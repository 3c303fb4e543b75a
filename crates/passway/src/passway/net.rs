use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};

/// Wildcard local address of the same family as `peer`.
///
/// UDP sockets must be bound before they can `connect`, and binding `0.0.0.0:0`
/// fails to reach an IPv6 peer, so the bind address follows the peer's family.
pub fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

/// Resolve `host:port`, preferring a literal parse over a DNS lookup.
pub async fn resolve_socket_addr(addr: &str) -> io::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("could not resolve {addr:?}"),
        )
    })
}
