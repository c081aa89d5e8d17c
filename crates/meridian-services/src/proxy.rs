//! SOCKS5 dialing for proxied peers.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

/// Dials peers through a SOCKS5 proxy on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocksDialer {
    proxy: SocketAddr,
}

impl SocksDialer {
    /// A dialer for the proxy listening on `127.0.0.1:port`.
    pub fn local(port: u16) -> Self {
        Self {
            proxy: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        }
    }

    pub fn proxy(&self) -> SocketAddr {
        self.proxy
    }

    /// Open a tunnel to `address` (`host:port`). The proxy resolves the host.
    ///
    /// The returned stream is a plain TCP connection to the proxy with the
    /// SOCKS negotiation already done, so callers treat it like a direct dial.
    pub async fn dial(&self, address: &str) -> io::Result<TcpStream> {
        tracing::debug!(proxy = %self.proxy, peer = address, "dialing through socks");
        let stream = Socks5Stream::connect(self.proxy, address)
            .await
            .map_err(|e| match e {
                tokio_socks::Error::Io(e) => e,
                other => io::Error::other(other),
            })?;
        Ok(stream.into_inner())
    }
}
