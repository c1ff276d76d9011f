//! SOCKS5 client outbound
//!
//! Implements RFC 1928 (SOCKS5) and RFC 1929 (username/password
//! authentication) on the client side:
//!
//! 1. Version identifier / method selection
//! 2. Optional username/password sub-negotiation
//! 3. CONNECT request for the original destination
//! 4. Reply validation (bound address is consumed and discarded)

use std::net::SocketAddrV4;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::socks5_common::{
    encode_socks5_addr, reply_message, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, AUTH_METHOD_NONE,
    AUTH_METHOD_NO_ACCEPTABLE, AUTH_METHOD_PASSWORD, AUTH_PASSWORD_VERSION, CMD_CONNECT,
    REPLY_SUCCEEDED, SOCKS5_VERSION,
};
use super::traits::{dial_server, Outbound, UpstreamConnection};
use crate::config::ProxyAuth;
use crate::error::OutboundError;

/// SOCKS5 proxy transport
pub struct Socks5Outbound {
    server: String,
    auth: Option<(String, String)>,
    connect_timeout: Duration,
}

impl Socks5Outbound {
    /// Create a SOCKS5 outbound
    #[must_use]
    pub fn new(
        server: impl Into<String>,
        auth: Option<&ProxyAuth>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            server: server.into(),
            auth: auth.map(|a| (a.username.clone(), a.password.clone())),
            connect_timeout,
        }
    }

    /// Method selection + optional auth sub-negotiation
    async fn handshake(&self, stream: &mut TcpStream) -> Result<(), OutboundError> {
        let methods: Vec<u8> = if self.auth.is_some() {
            vec![SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
        } else {
            vec![SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
        };

        trace!("sending SOCKS5 method selection: {:?}", methods);
        stream.write_all(&methods).await?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;

        if response[0] != SOCKS5_VERSION {
            return Err(OutboundError::handshake(format!(
                "invalid SOCKS version: expected {SOCKS5_VERSION}, got {}",
                response[0]
            )));
        }

        match response[1] {
            AUTH_METHOD_NONE => Ok(()),
            AUTH_METHOD_PASSWORD => self.authenticate(stream).await,
            AUTH_METHOD_NO_ACCEPTABLE => Err(OutboundError::handshake(
                "no acceptable authentication method",
            )),
            other => Err(OutboundError::handshake(format!(
                "unsupported auth method: {other:#04x}"
            ))),
        }
    }

    /// RFC 1929 username/password sub-negotiation
    async fn authenticate(&self, stream: &mut TcpStream) -> Result<(), OutboundError> {
        let Some((username, password)) = &self.auth else {
            return Err(OutboundError::handshake(
                "server requires authentication but no credentials are configured",
            ));
        };

        if username.len() > 255 || password.len() > 255 {
            return Err(OutboundError::handshake(
                "SOCKS5 credentials longer than 255 bytes",
            ));
        }

        // VER | ULEN | USERNAME | PLEN | PASSWORD
        // Length casts are safe: both were validated against 255 above
        #[allow(clippy::cast_possible_truncation)]
        let (ulen, plen) = (username.len() as u8, password.len() as u8);
        let mut request = Vec::with_capacity(3 + username.len() + password.len());
        request.push(AUTH_PASSWORD_VERSION);
        request.push(ulen);
        request.extend_from_slice(username.as_bytes());
        request.push(plen);
        request.extend_from_slice(password.as_bytes());

        stream.write_all(&request).await?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;

        if response[0] != AUTH_PASSWORD_VERSION {
            return Err(OutboundError::handshake(format!(
                "invalid auth version: {:#04x}",
                response[0]
            )));
        }
        if response[1] != 0x00 {
            return Err(OutboundError::handshake("SOCKS5 authentication failed"));
        }

        trace!("SOCKS5 authentication successful");
        Ok(())
    }

    /// Issue CONNECT and validate the reply
    async fn request_connect(
        &self,
        stream: &mut TcpStream,
        target: SocketAddrV4,
    ) -> Result<(), OutboundError> {
        // VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
        let mut request = Vec::with_capacity(10);
        request.push(SOCKS5_VERSION);
        request.push(CMD_CONNECT);
        request.push(0x00);
        request.extend_from_slice(&encode_socks5_addr(target));
        stream.write_all(&request).await?;

        // Reply header: VER | REP | RSV | ATYP
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(OutboundError::handshake(format!(
                "invalid SOCKS version in reply: {:#04x}",
                header[0]
            )));
        }
        if header[1] != REPLY_SUCCEEDED {
            return Err(OutboundError::handshake(format!(
                "SOCKS5 server error (code {:#04x}): {}",
                header[1],
                reply_message(header[1])
            )));
        }

        // Consume the bound address; it is not needed for relaying
        match header[3] {
            ATYP_IPV4 => {
                let mut rest = [0u8; 6];
                stream.read_exact(&mut rest).await?;
            }
            ATYP_IPV6 => {
                let mut rest = [0u8; 18];
                stream.read_exact(&mut rest).await?;
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut rest = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut rest).await?;
            }
            other => {
                return Err(OutboundError::handshake(format!(
                    "invalid address type in reply: {other:#04x}"
                )));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Outbound for Socks5Outbound {
    async fn connect(&self, target: SocketAddrV4) -> Result<UpstreamConnection, OutboundError> {
        let mut stream = dial_server(&self.server, self.connect_timeout).await?;

        let negotiation = async {
            self.handshake(&mut stream).await?;
            self.request_connect(&mut stream, target).await
        };
        match timeout(self.connect_timeout, negotiation).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(OutboundError::timeout(
                    &self.server,
                    self.connect_timeout.as_secs(),
                ))
            }
        }

        debug!(server = %self.server, %target, "SOCKS5 CONNECT succeeded");
        Ok(Box::new(stream))
    }

    fn kind(&self) -> &'static str {
        "socks5"
    }
}
