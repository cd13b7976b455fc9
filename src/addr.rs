//! Network name parsing and address resolution.
//!
//! Mirrors the `tcp`/`tcp4`/`tcp6` network selectors of the sockets API:
//! `tcp` accepts whichever family resolution yields first, the suffixed
//! forms constrain the family. Hostnames go through the system resolver.

use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use crate::error::{Error, Result};

/// Address family selector accepted by [`dial`](crate::dial) and
/// [`listen`](crate::listen).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// Either family.
    Tcp,
    /// IPv4 only.
    Tcp4,
    /// IPv6 only.
    Tcp6,
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(Error::Resolve(format!("unknown network {other:?}"))),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Tcp4 => write!(f, "tcp4"),
            Network::Tcp6 => write!(f, "tcp6"),
        }
    }
}

impl Network {
    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

/// Resolve `address` (`host:port`, hostname or literal) to a socket address
/// of the requested family.
pub(crate) fn resolve(network: Network, address: &str) -> Result<SocketAddr> {
    let addrs = address
        .to_socket_addrs()
        .map_err(|e| Error::Resolve(format!("{address}: {e}")))?;
    addrs
        .into_iter()
        .find(|a| network.accepts(a))
        .ok_or_else(|| Error::Resolve(format!("no {network} address for {address}")))
}

/// Resolve a bind address. A bare `:port` means the unspecified address of
/// the requested family (wildcard bind).
pub(crate) fn resolve_bind(network: Network, address: &str) -> Result<SocketAddr> {
    if address.starts_with(':') {
        let text = match network {
            Network::Tcp | Network::Tcp4 => format!("0.0.0.0{address}"),
            Network::Tcp6 => format!("[::]{address}"),
        };
        return resolve(network, &text);
    }
    resolve(network, address)
}
