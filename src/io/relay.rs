//! Bidirectional relay between a terminated connection and its upstream
//!
//! The relay drives both copy directions concurrently and resolves as
//! soon as EITHER direction finishes: clean EOF (read done, writer
//! flushed and shut down) or error. The caller then drops both streams,
//! which closes them and unblocks whatever the other direction was
//! waiting on. This first-completion behavior is what bounds a
//! forwarding session: a half-dead connection never keeps the session
//! alive.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::buffer::DEFAULT_BUFFER_SIZE;

/// Which relay direction finished first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Terminated connection → upstream
    ClientToUpstream,
    /// Upstream → terminated connection
    UpstreamToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientToUpstream => write!(f, "client->upstream"),
            Self::UpstreamToClient => write!(f, "upstream->client"),
        }
    }
}

/// Outcome of a relay session
#[derive(Debug)]
pub struct RelayResult {
    /// Bytes transferred from client to upstream
    pub client_to_upstream: u64,
    /// Bytes transferred from upstream to client
    pub upstream_to_client: u64,
    /// The direction that ended the session
    pub finished: Direction,
    /// The error that ended it, if it did not end on clean EOF
    pub error: Option<io::Error>,
}

impl RelayResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

/// State for one direction of transfer
struct TransferState {
    buf: Box<[u8]>,
    read_done: bool,
    pos: usize,
    cap: usize,
    bytes_transferred: u64,
}

impl TransferState {
    fn new(buf_size: usize) -> Self {
        Self {
            buf: vec![0u8; buf_size].into_boxed_slice(),
            read_done: false,
            pos: 0,
            cap: 0,
            bytes_transferred: 0,
        }
    }

    fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            // If there's data in the buffer, try to write it
            if self.pos < self.cap {
                let n = match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero bytes",
                        )));
                    }
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                };
                self.pos += n;
                self.bytes_transferred += n as u64;

                if self.pos == self.cap {
                    self.pos = 0;
                    self.cap = 0;
                }
            } else if self.read_done {
                // EOF observed and everything written: flush and half-close
                match writer.as_mut().poll_flush(cx) {
                    Poll::Ready(Ok(())) => {}
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
                match writer.as_mut().poll_shutdown(cx) {
                    Poll::Ready(Ok(())) => {}
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
                return Poll::Ready(Ok(()));
            } else {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cap = n;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }
}

/// Relay future over a client/upstream stream pair
struct Relay<'a, A: ?Sized, B: ?Sized> {
    client: &'a mut A,
    upstream: &'a mut B,
    c2u: TransferState,
    u2c: TransferState,
}

impl<A, B> std::future::Future for Relay<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    type Output = RelayResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if let Poll::Ready(res) =
            this.c2u
                .poll_transfer(cx, Pin::new(&mut *this.client), Pin::new(&mut *this.upstream))
        {
            return Poll::Ready(RelayResult {
                client_to_upstream: this.c2u.bytes_transferred,
                upstream_to_client: this.u2c.bytes_transferred,
                finished: Direction::ClientToUpstream,
                error: res.err(),
            });
        }

        if let Poll::Ready(res) =
            this.u2c
                .poll_transfer(cx, Pin::new(&mut *this.upstream), Pin::new(&mut *this.client))
        {
            return Poll::Ready(RelayResult {
                client_to_upstream: this.c2u.bytes_transferred,
                upstream_to_client: this.u2c.bytes_transferred,
                finished: Direction::UpstreamToClient,
                error: res.err(),
            });
        }

        Poll::Pending
    }
}

/// Relay bytes between two streams until either direction finishes
///
/// Resolves on the first direction to reach EOF (with the peer's write
/// side flushed and shut down) or to fail. The other direction may still
/// have data in flight; the caller is expected to close both streams.
pub async fn relay<A, B>(client: &mut A, upstream: &mut B) -> RelayResult
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    relay_with_buffer(client, upstream, DEFAULT_BUFFER_SIZE).await
}

/// Relay with a custom per-direction buffer size
pub async fn relay_with_buffer<A, B>(
    client: &mut A,
    upstream: &mut B,
    buf_size: usize,
) -> RelayResult
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    Relay {
        client,
        upstream,
        c2u: TransferState::new(buf_size),
        u2c: TransferState::new(buf_size),
    }
    .await
}
