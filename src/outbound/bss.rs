//! "bss" framed transport with per-chunk AES-GCM encryption
//!
//! Handshake: one length-prefixed frame carrying the base64-encoded
//! target address out, one length-prefixed frame back that must read
//! exactly `"ok"`. After that, every chunk of payload (at most 32 KiB of
//! plaintext) is sealed independently with AES-GCM under a fresh random
//! 12-byte nonce; the wire format per block is
//!
//! ```text
//! [u32 len | big-endian] [nonce | 12 bytes] [ciphertext + tag]
//! ```
//!
//! where `len` covers nonce and ciphertext. A block that fails to
//! decrypt is unrecoverable and fails the read direction.
//!
//! The key is part of the transport configuration and may be 16, 24 or
//! 32 bytes (AES-128/192/256-GCM).

use std::io;
use std::net::SocketAddrV4;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Buf, BufMut, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::framed::{expect_ok, write_frame, MAX_FRAME_LEN};
use super::traits::{dial_server, Outbound, UpstreamConnection};
use crate::error::OutboundError;

/// Maximum plaintext per encrypted chunk
pub const MAX_CHUNK: usize = 32 * 1024;

/// AES-GCM nonce length
const NONCE_LEN: usize = 12;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// AES-GCM cipher over one of the three supported key sizes
#[derive(Clone)]
pub(crate) enum BssCipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl BssCipher {
    /// Build a cipher from a raw key
    pub(crate) fn new(key: &[u8]) -> Result<Self, OutboundError> {
        match key.len() {
            16 => Ok(Self::Aes128(Aes128Gcm::new(GenericArray::from_slice(key)))),
            24 => Ok(Self::Aes192(Aes192Gcm::new(GenericArray::from_slice(key)))),
            32 => Ok(Self::Aes256(Aes256Gcm::new(GenericArray::from_slice(key)))),
            n => Err(OutboundError::handshake(format!(
                "bss key must be 16, 24 or 32 bytes, got {n}"
            ))),
        }
    }

    fn seal(&self, nonce: &[u8; NONCE_LEN], plain: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
        let nonce = GenericArray::from_slice(nonce);
        match self {
            Self::Aes128(c) => c.encrypt(nonce, plain),
            Self::Aes192(c) => c.encrypt(nonce, plain),
            Self::Aes256(c) => c.encrypt(nonce, plain),
        }
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
        let nonce = GenericArray::from_slice(nonce);
        match self {
            Self::Aes128(c) => c.decrypt(nonce, ciphertext),
            Self::Aes192(c) => c.decrypt(nonce, ciphertext),
            Self::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
    }
}

/// Duplex stream applying the per-chunk encryption framing
pub struct BssStream<S> {
    inner: S,
    cipher: BssCipher,
    /// Decrypted bytes not yet handed to the reader
    read_plain: BytesMut,
    /// Raw frame bytes accumulated from the wire
    read_raw: BytesMut,
    /// Encrypted frame bytes not yet written to the wire
    write_pending: BytesMut,
    /// Scratch buffer for inner reads
    scratch: Box<[u8]>,
}

impl<S> BssStream<S> {
    /// Wrap an established (post-handshake) stream
    pub(crate) fn new(inner: S, cipher: BssCipher) -> Self {
        Self {
            inner,
            cipher,
            read_plain: BytesMut::new(),
            read_raw: BytesMut::new(),
            write_pending: BytesMut::new(),
            scratch: vec![0u8; 16 * 1024].into_boxed_slice(),
        }
    }

    /// Decode one complete frame out of `read_raw`, if present
    ///
    /// Appends the decrypted plaintext to `read_plain`. `Ok(false)`
    /// means more wire bytes are needed.
    fn decode_frame(&mut self) -> io::Result<bool> {
        if self.read_raw.len() < 4 {
            return Ok(false);
        }
        let frame_len = u32::from_be_bytes([
            self.read_raw[0],
            self.read_raw[1],
            self.read_raw[2],
            self.read_raw[3],
        ]) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("encrypted frame length {frame_len} exceeds limit {MAX_FRAME_LEN}"),
            ));
        }
        if self.read_raw.len() < 4 + frame_len {
            return Ok(false);
        }
        self.read_raw.advance(4);
        let frame = self.read_raw.split_to(frame_len);
        if frame.len() < NONCE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "encrypted frame shorter than nonce",
            ));
        }
        let (nonce, ciphertext) = frame.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .open(nonce, ciphertext)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk decryption failed"))?;
        self.read_plain.extend_from_slice(&plain);
        Ok(true)
    }

    /// Seal one plaintext chunk into a wire frame
    fn encrypt_frame(&self, chunk: &[u8]) -> io::Result<BytesMut> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .seal(&nonce, chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "chunk encryption failed"))?;
        let mut frame = BytesMut::with_capacity(4 + NONCE_LEN + ciphertext.len());
        frame.put_u32(u32::try_from(NONCE_LEN + ciphertext.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "encrypted chunk too large")
        })?);
        frame.put_slice(&nonce);
        frame.put_slice(&ciphertext);
        Ok(frame)
    }
}

impl<S: AsyncWrite + Unpin> BssStream<S> {
    /// Push buffered frame bytes into the inner stream
    fn poll_drain_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_pending.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.write_pending) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write zero bytes",
                    )));
                }
                Poll::Ready(Ok(n)) => {
                    self.write_pending.advance(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BssStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            // Serve already-decrypted bytes first
            if !this.read_plain.is_empty() {
                let n = buf.remaining().min(this.read_plain.len());
                buf.put_slice(&this.read_plain.split_to(n));
                return Poll::Ready(Ok(()));
            }

            // Decode complete frames already buffered
            match this.decode_frame() {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => return Poll::Ready(Err(e)),
            }

            // Need more wire bytes
            let mut scratch = ReadBuf::new(&mut this.scratch);
            match Pin::new(&mut this.inner).poll_read(cx, &mut scratch) {
                Poll::Ready(Ok(())) => {
                    let filled = scratch.filled();
                    if filled.is_empty() {
                        if this.read_raw.is_empty() {
                            // Clean EOF on a frame boundary
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed mid-frame",
                        )));
                    }
                    this.read_raw.extend_from_slice(filled);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BssStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // The previous chunk's frame must be fully handed to the inner
        // stream before a new chunk is accepted.
        match this.poll_drain_pending(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let chunk_len = buf.len().min(MAX_CHUNK);
        this.write_pending = match this.encrypt_frame(&buf[..chunk_len]) {
            Ok(frame) => frame,
            Err(e) => return Poll::Ready(Err(e)),
        };

        // Opportunistic push; leftovers drain on the next write or flush
        if let Poll::Ready(Err(e)) = this.poll_drain_pending(cx) {
            return Poll::Ready(Err(e));
        }

        Poll::Ready(Ok(chunk_len))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain_pending(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain_pending(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Encrypted framed-handshake transport
pub struct BssOutbound {
    server: String,
    cipher: BssCipher,
    connect_timeout: Duration,
}

impl BssOutbound {
    /// Create a bss outbound
    ///
    /// # Errors
    ///
    /// Returns `OutboundError` if the key is not 16, 24 or 32 bytes.
    pub fn new(
        server: impl Into<String>,
        key: &[u8],
        connect_timeout: Duration,
    ) -> Result<Self, OutboundError> {
        Ok(Self {
            server: server.into(),
            cipher: BssCipher::new(key)?,
            connect_timeout,
        })
    }

    async fn handshake(&self, stream: &mut TcpStream, target: SocketAddrV4) -> Result<(), OutboundError> {
        let encoded = BASE64.encode(target.to_string());
        write_frame(stream, encoded.as_bytes()).await?;
        expect_ok(stream).await
    }
}

#[async_trait]
impl Outbound for BssOutbound {
    async fn connect(&self, target: SocketAddrV4) -> Result<UpstreamConnection, OutboundError> {
        let mut stream = dial_server(&self.server, self.connect_timeout).await?;

        match timeout(self.connect_timeout, self.handshake(&mut stream, target)).await {
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

        debug!(server = %self.server, %target, "bss handshake complete");
        Ok(Box::new(BssStream::new(stream, self.cipher.clone())))
    }

    fn kind(&self) -> &'static str {
        "bss"
    }
}
