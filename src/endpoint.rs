//! Endpoint resolution.
//!
//! An [`Endpoint`] is a resolved `(address, port)` pair. Resolution goes
//! through the system resolver and keeps the first address it returns,
//! preferring IPv4 so that a `localhost` lookup lands on the same family a
//! loopback listener binds to.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::error::{ExchangeError, Result};

/// A reachable peer or a local bind address. Immutable once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// Loopback endpoint on `port`.
    pub fn local(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    /// Resolve `host:port` text (e.g. `localhost:11000`, `10.0.0.1:80`).
    pub fn resolve(target: &str) -> Result<Self> {
        let resolve_err = |source| ExchangeError::Resolve {
            target: target.to_string(),
            source,
        };

        let addrs: Vec<SocketAddr> = target.to_socket_addrs().map_err(resolve_err)?.collect();

        addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .map(Self)
            .ok_or_else(|| {
                resolve_err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no addresses returned",
                ))
            })
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for Endpoint {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::resolve(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
