//! Trojan-style TLS outbound
//!
//! Dials the server over TCP, upgrades to TLS (with optional
//! certificate-verification skip), then sends a fixed-format header in a
//! single write before any payload:
//!
//! ```text
//! hex(SHA-224(password))  [56 bytes]
//! CRLF
//! command                 [1 byte, TCP = 0x01]
//! SOCKS5-encoded target address
//! CRLF
//! ```
//!
//! The protocol is write-then-stream: no response is read before the
//! relay starts; the TLS stream itself is the upstream connection.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as RustlsError, SignatureScheme};
use sha2::{Digest, Sha224};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::socks5_common::encode_socks5_addr;
use super::traits::{dial_server, Outbound, UpstreamConnection};
use crate::error::OutboundError;

/// Trojan command code for TCP relaying
const COMMAND_TCP: u8 = 0x01;

const CRLF: &[u8] = b"\r\n";

/// Lowercase hex of the SHA-224 digest, as the protocol transmits it
fn hex_sha224(data: &[u8]) -> [u8; 56] {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let digest = Sha224::digest(data);
    let mut out = [0u8; 56];
    for (i, byte) in digest.iter().enumerate() {
        out[i * 2] = HEX[usize::from(byte >> 4)];
        out[i * 2 + 1] = HEX[usize::from(byte & 0x0f)];
    }
    out
}

/// Build the one-shot header written before any payload
fn build_header(hex_password: &[u8; 56], target: SocketAddrV4) -> BytesMut {
    let addr = encode_socks5_addr(target);
    let mut header = BytesMut::with_capacity(56 + 2 + 1 + addr.len() + 2);
    header.put_slice(hex_password);
    header.put_slice(CRLF);
    header.put_u8(COMMAND_TCP);
    header.put_slice(&addr);
    header.put_slice(CRLF);
    header
}

/// TLS-token ("trojan") transport
pub struct TrojanOutbound {
    server: String,
    hex_password: [u8; 56],
    server_name: ServerName<'static>,
    connector: TlsConnector,
    connect_timeout: Duration,
}

impl TrojanOutbound {
    /// Create a trojan outbound
    ///
    /// The SNI is the configured domain, falling back to the server
    /// host.
    ///
    /// # Errors
    ///
    /// Returns `OutboundError::Tls` for an unusable server name.
    pub fn new(
        server: impl Into<String>,
        password: &str,
        domain: Option<&str>,
        skip_cert_verify: bool,
        connect_timeout: Duration,
    ) -> Result<Self, OutboundError> {
        let server = server.into();
        let host = server
            .rsplit_once(':')
            .map_or(server.as_str(), |(h, _)| h)
            .to_string();
        let sni = domain.map_or(host, str::to_string);

        let server_name = ServerName::try_from(sni.clone())
            .map_err(|_| OutboundError::Tls(format!("invalid server name {sni:?}")))?;

        let config = if skip_cert_verify {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
                .with_no_client_auth()
        } else {
            let root_store =
                rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };

        Ok(Self {
            server,
            hex_password: hex_sha224(password.as_bytes()),
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
            connect_timeout,
        })
    }
}

#[async_trait]
impl Outbound for TrojanOutbound {
    async fn connect(&self, target: SocketAddrV4) -> Result<UpstreamConnection, OutboundError> {
        let stream = dial_server(&self.server, self.connect_timeout).await?;

        let tls_connect = self.connector.connect(self.server_name.clone(), stream);
        let mut tls_stream = match timeout(self.connect_timeout, tls_connect).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(OutboundError::Tls(e.to_string())),
            Err(_) => {
                return Err(OutboundError::timeout(
                    &self.server,
                    self.connect_timeout.as_secs(),
                ))
            }
        };

        // Single write; the stream is usable for payload immediately
        let header = build_header(&self.hex_password, target);
        tls_stream.write_all(&header).await?;

        debug!(server = %self.server, %target, "trojan header written");
        Ok(Box::new(tls_stream))
    }

    fn kind(&self) -> &'static str {
        "trojan"
    }
}

/// Certificate verifier that accepts anything
///
/// Only reachable through the explicit `skip_cert_verify` flag.
#[derive(Debug)]
struct InsecureServerCertVerifier;

impl ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
