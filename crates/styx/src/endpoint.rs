//! Endpoint taxonomy for stream transports.
//!
//! Endpoints are written in dial-string form: `tcp!address!port` for IP
//! endpoints (v4 or v6) and `unix!path` for unix-domain sockets.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use crate::io_err;
use crate::utils::Result;

/// Where a server listens and a client dials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Endpoint> {
        let mut parts = s.split('!');

        match parts.next() {
            Some("tcp") => {
                let (host, port) = match (parts.next(), parts.next()) {
                    (Some(host), Some(port)) => (host, port),
                    _ => return Err(io_err!(InvalidInput, "expected tcp!address!port").into()),
                };

                let address: IpAddr = host
                    .parse()
                    .map_err(|_| io_err!(InvalidInput, "invalid IP address"))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| io_err!(InvalidInput, "invalid port"))?;

                Ok(Endpoint::Tcp(SocketAddr::new(address, port)))
            }
            Some("unix") => match parts.next() {
                Some(path) if !path.is_empty() => Ok(Endpoint::Unix(PathBuf::from(path))),
                _ => Err(io_err!(InvalidInput, "expected unix!path").into()),
            },
            _ => Err(io_err!(InvalidInput, "unknown endpoint protocol").into()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Endpoint> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Endpoint::Tcp(addr) => write!(f, "tcp!{}!{}", addr.ip(), addr.port()),
            Endpoint::Unix(ref path) => write!(f, "unix!{}", path.display()),
        }
    }
}
