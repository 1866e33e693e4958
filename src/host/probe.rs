//! Connectivity probe for the managed database service.

use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use url::{Host, Url};

use super::ConnectivityProbe;

/// Port used when the endpoint URL does not name one.
pub const DEFAULT_PORT: u16 = 5432;

/// Resolves the socket addresses of an endpoint URL.
pub(crate) fn endpoint_addrs(endpoint: &Url) -> Result<Vec<SocketAddr>> {
    let port = endpoint.port().unwrap_or(DEFAULT_PORT);
    let addrs = match endpoint.host() {
        Some(Host::Ipv4(ip)) => vec![SocketAddr::new(IpAddr::V4(ip), port)],
        Some(Host::Ipv6(ip)) => vec![SocketAddr::new(IpAddr::V6(ip), port)],
        Some(Host::Domain(domain)) => (domain, port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {}", domain))?
            .collect(),
        None => bail!("endpoint {} has no host", endpoint),
    };
    if addrs.is_empty() {
        bail!("endpoint {} resolved to no addresses", endpoint);
    }
    Ok(addrs)
}

/// Opens a TCP connection to the endpoint and closes it again.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

impl TcpProbe {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ConnectivityProbe for TcpProbe {
    fn try_connect(&self, endpoint: &Url) -> Result<()> {
        let mut last_error = None;
        for addr in endpoint_addrs(endpoint)? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => {
                    tracing::debug!("connected to {}", addr);
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!("connection to {} failed: {}", addr, e);
                    last_error = Some((addr, e));
                }
            }
        }
        match last_error {
            Some((addr, e)) => Err(e).with_context(|| format!("cannot connect to {}", addr)),
            None => bail!("no address to connect to for {}", endpoint),
        }
    }
}
