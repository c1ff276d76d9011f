//! "oks" framed transport
//!
//! The simplest upstream protocol: dial the server, send the target
//! address as one length-prefixed plaintext frame, require the literal
//! `"ok"` back, then relay the raw stream unmodified in both directions.

use std::net::SocketAddrV4;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::debug;

use super::framed::{expect_ok, write_frame};
use super::traits::{dial_server, Outbound, UpstreamConnection};
use crate::error::OutboundError;

/// Plaintext framed-handshake transport
#[derive(Debug, Clone)]
pub struct OksOutbound {
    server: String,
    connect_timeout: Duration,
}

impl OksOutbound {
    /// Create an oks outbound for the given `host:port` server
    #[must_use]
    pub fn new(server: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            server: server.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Outbound for OksOutbound {
    async fn connect(&self, target: SocketAddrV4) -> Result<UpstreamConnection, OutboundError> {
        let mut stream = dial_server(&self.server, self.connect_timeout).await?;

        let handshake = async {
            write_frame(&mut stream, target.to_string().as_bytes()).await?;
            expect_ok(&mut stream).await
        };
        match timeout(self.connect_timeout, handshake).await {
            Ok(Ok(())) => {}
            // The dialed connection drops (closes) on every failure path
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(OutboundError::timeout(
                    &self.server,
                    self.connect_timeout.as_secs(),
                ))
            }
        }

        debug!(server = %self.server, %target, "oks handshake complete");
        Ok(Box::new(stream))
    }

    fn kind(&self) -> &'static str {
        "oks"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::outbound::framed::{read_frame, MAX_HANDSHAKE_FRAME_LEN};

    async fn spawn_server(response: &'static [u8]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_frame(&mut socket, MAX_HANDSHAKE_FRAME_LEN)
                .await
                .unwrap();
            assert!(!request.is_empty());
            write_frame(&mut socket, response).await.unwrap();
            // Echo whatever arrives afterwards
            let mut buf = [0u8; 256];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if socket.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_handshake_and_relay() {
        let addr = spawn_server(b"ok").await;
        let outbound = OksOutbound::new(addr.to_string(), Duration::from_secs(1));

        let target = "93.184.216.34:443".parse().unwrap();
        let mut conn = outbound.connect(target).await.unwrap();

        // Post-handshake bytes pass through unmodified
        conn.write_all(b"payload").await.unwrap();
        let mut echo = [0u8; 7];
        conn.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"payload");
    }

    #[tokio::test]
    async fn test_rejection_surfaces_body() {
        let addr = spawn_server(b"quota exceeded").await;
        let outbound = OksOutbound::new(addr.to_string(), Duration::from_secs(1));

        let target = "10.0.0.1:80".parse().unwrap();
        let err = outbound.connect(target).await.err().unwrap();
        assert_eq!(err.to_string(), "quota exceeded");
    }

    #[tokio::test]
    async fn test_server_unreachable() {
        let outbound = OksOutbound::new("127.0.0.1:1", Duration::from_millis(500));
        let target = "10.0.0.1:80".parse().unwrap();
        assert!(outbound.connect(target).await.is_err());
    }
}
