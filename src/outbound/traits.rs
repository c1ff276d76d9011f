//! Outbound trait definitions and shared dialing
//!
//! This module defines the core `Outbound` trait that every upstream
//! transport implements, plus the TCP dial helper they share.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::OutboundError;
use crate::netstack::AsyncDuplex;

/// The duplex stream produced by a transport once its handshake is done
pub type UpstreamConnection = Box<dyn AsyncDuplex>;

/// Core trait for upstream transports
///
/// `connect` turns a logical "connect to this original destination
/// through the configured upstream" request into an established duplex
/// byte stream. Cancellation is structural: the engine races the
/// returned future against its shutdown token, and dropping the future
/// closes the half-built connection.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Connect to the target through this transport
    ///
    /// # Errors
    ///
    /// Returns `OutboundError` if the dial or handshake fails; the
    /// partially-built connection is closed before returning.
    async fn connect(&self, target: std::net::SocketAddrV4)
        -> Result<UpstreamConnection, OutboundError>;

    /// Short name of the transport kind
    fn kind(&self) -> &'static str;
}

/// Resolve a `host:port` server string to socket addresses
///
/// # Errors
///
/// Returns `OutboundError::ConnectionFailed` on resolution failure or an
/// empty result.
pub fn resolve_server(server: &str) -> Result<Vec<SocketAddr>, OutboundError> {
    // Literal socket addresses skip the resolver
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(vec![addr]);
    }

    let addrs: Vec<SocketAddr> = server
        .to_socket_addrs()
        .map_err(|e| OutboundError::connection_failed(server, format!("DNS resolution: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(OutboundError::connection_failed(
            server,
            "no addresses returned",
        ));
    }

    Ok(addrs)
}

/// Dial a proxy server (or direct target) with the shared socket options
///
/// Tries each resolved address in order; the first to connect within the
/// timeout wins. The stream comes back with `TCP_NODELAY` and keepalive
/// configured.
///
/// # Errors
///
/// Returns the last dial error, or a timeout error if every attempt
/// timed out.
pub async fn dial_server(
    server: &str,
    connect_timeout: Duration,
) -> Result<TcpStream, OutboundError> {
    let addrs = resolve_server(server)?;

    let mut last_error = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                configure_socket(&stream);
                debug!(server, %addr, "upstream TCP connection established");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                last_error = Some(OutboundError::connection_failed(
                    addr.to_string(),
                    e.to_string(),
                ));
            }
            Err(_) => {
                last_error = Some(OutboundError::timeout(
                    addr.to_string(),
                    connect_timeout.as_secs(),
                ));
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| OutboundError::connection_failed(server, "no addresses to connect to")))
}

/// Set `TCP_NODELAY` and keepalive; failures are logged, not fatal
fn configure_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY");
    }

    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(15));
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to set TCP keepalive");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_literal_addr() {
        let addrs = resolve_server("127.0.0.1:1080").unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].port(), 1080);
    }

    #[test]
    fn test_resolve_hostname() {
        let addrs = resolve_server("localhost:443").unwrap();
        assert!(!addrs.is_empty());
    }

    #[tokio::test]
    async fn test_dial_connection_refused() {
        // Port 1 on loopback should refuse quickly
        let result = dial_server("127.0.0.1:1", Duration::from_millis(500)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dial_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await });
        let stream = dial_server(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());
        accept.await.unwrap().unwrap();
    }
}
