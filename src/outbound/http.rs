//! HTTP CONNECT outbound
//!
//! Dials the proxy, issues a `CONNECT target` request with an optional
//! `Proxy-Authorization: Basic` header, and requires a 200 response.
//! The response parser reads in blocks, so it can over-read past the
//! header terminator; those bytes are upstream payload and are replayed
//! ahead of the socket through a prefix wrapper, never discarded.

use std::io;
use std::net::SocketAddrV4;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::timeout;
use tracing::debug;

use super::traits::{dial_server, Outbound, UpstreamConnection};
use crate::config::ProxyAuth;
use crate::error::OutboundError;

/// Upper bound on the proxy's response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// HTTP CONNECT tunnel transport
pub struct HttpOutbound {
    server: String,
    auth_header: Option<String>,
    connect_timeout: Duration,
}

impl HttpOutbound {
    /// Create an HTTP CONNECT outbound
    #[must_use]
    pub fn new(
        server: impl Into<String>,
        auth: Option<&ProxyAuth>,
        connect_timeout: Duration,
    ) -> Self {
        let auth_header = auth.map(|a| {
            let credentials = BASE64.encode(format!("{}:{}", a.username, a.password));
            format!("Basic {credentials}")
        });
        Self {
            server: server.into(),
            auth_header,
            connect_timeout,
        }
    }

    fn request_head(&self, target: SocketAddrV4) -> String {
        let mut head = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(auth) = &self.auth_header {
            head.push_str("Proxy-Authorization: ");
            head.push_str(auth);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        head
    }
}

/// Read the response head and return (status, bytes past the terminator)
async fn read_response_head<S>(stream: &mut S) -> Result<(u16, Bytes), OutboundError>
where
    S: AsyncRead + Unpin,
{
    let mut head = BytesMut::with_capacity(512);
    let terminator = loop {
        if let Some(pos) = find_terminator(&head) {
            break pos;
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(OutboundError::handshake("proxy response head too large"));
        }
        let n = stream.read_buf(&mut head).await?;
        if n == 0 {
            return Err(OutboundError::handshake(
                "proxy closed connection before completing CONNECT response",
            ));
        }
    };

    let header_bytes = head.split_to(terminator + 4);
    let leftover = head.freeze();

    let status_line = header_bytes
        .as_ref()
        .split(|&b| b == b'\r')
        .next()
        .unwrap_or_default();
    let status_line = std::str::from_utf8(status_line)
        .map_err(|_| OutboundError::handshake("proxy response status line is not UTF-8"))?;

    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            OutboundError::handshake(format!("malformed proxy status line: {status_line:?}"))
        })?;

    Ok((status, leftover))
}

fn find_terminator(head: &[u8]) -> Option<usize> {
    head.windows(4).position(|w| w == b"\r\n\r\n")
}

#[async_trait]
impl Outbound for HttpOutbound {
    async fn connect(&self, target: SocketAddrV4) -> Result<UpstreamConnection, OutboundError> {
        let mut stream = dial_server(&self.server, self.connect_timeout).await?;

        let handshake = async {
            stream
                .write_all(self.request_head(target).as_bytes())
                .await?;
            read_response_head(&mut stream).await
        };
        let (status, leftover) = match timeout(self.connect_timeout, handshake).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(OutboundError::timeout(
                    &self.server,
                    self.connect_timeout.as_secs(),
                ))
            }
        };

        if status != 200 {
            return Err(OutboundError::handshake(format!(
                "proxy returned status {status}"
            )));
        }

        debug!(
            server = %self.server,
            %target,
            buffered = leftover.len(),
            "CONNECT tunnel established"
        );

        Ok(Box::new(PrefixedStream::new(leftover, stream)))
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

/// Stream that replays a prefix before reading from the inner stream
///
/// Writes always go straight through.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    /// Wrap a stream with bytes that were over-read during the handshake
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = buf.remaining().min(this.prefix.len());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
