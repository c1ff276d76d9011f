//! Virtual network stack boundary and adapter
//!
//! The user-space TCP/IP stack that terminates diverted connections is a
//! third-party dependency, injected behind a deliberately narrow seam:
//! inject a packet, read an emitted packet, receive accepted TCP
//! connections, tear down. Everything the engine needs and nothing
//! else, so the stack can be swapped or mocked without touching the
//! interception logic.
//!
//! The [`StackAdapter`] owns the engine side of that seam: it feeds
//! diverted packets inbound, pumps stack-emitted frames back out through
//! the capture handle, and guards the teardown sequence so it runs
//! exactly once no matter how many shutdown paths race.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capture::{CaptureMetadata, InterceptedPacket, PacketCapture};
use crate::error::StackError;
use crate::tracker::FlowKey;

/// Receive window registered with the stack's TCP forwarder (16 KiB)
pub const DEFAULT_RCV_WND: usize = 16 * 1024;

/// Bound on in-flight (pre-accept) connection attempts
///
/// Caps resource use under SYN flood or high connection churn; attempts
/// beyond the bound are ignored by the forwarder.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1 << 15;

/// Packet capacity of the channel-style link endpoint
pub const DEFAULT_LINK_CHANNEL_CAPACITY: usize = 512;

/// Parameters for standing up the virtual stack
#[derive(Debug, Clone, Copy)]
pub struct StackConfig {
    /// Link endpoint MTU (the intercepted interface's MTU)
    pub mtu: u32,
    /// TCP receive window
    pub rcv_wnd: usize,
    /// In-flight connection attempt bound
    pub max_in_flight: usize,
    /// Link endpoint channel capacity
    pub channel_capacity: usize,
}

impl StackConfig {
    /// Config with defaults for the given MTU
    #[must_use]
    pub const fn for_mtu(mtu: u32) -> Self {
        Self {
            mtu,
            rcv_wnd: DEFAULT_RCV_WND,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            channel_capacity: DEFAULT_LINK_CHANNEL_CAPACITY,
        }
    }
}

/// A duplex byte stream
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> AsyncDuplex for T {}

/// The TCP connection as seen from inside the virtual stack, after the
/// 3-way handshake completed there
pub type TerminatedConnection = Box<dyn AsyncDuplex>;

/// The running virtual stack
///
/// Implementations wrap the third-party stack instance, its NIC and its
/// link endpoint. `shutdown` performs the full ordered teardown (close
/// the link endpoint, destroy the stack, close the TCP forwarder) and
/// must be idempotent; a pending `read_outbound` resolves to `None` once
/// the endpoint closes.
#[async_trait]
pub trait NetStack: Send + Sync {
    /// Inject a diverted packet as inbound traffic on the virtual NIC
    fn inject_inbound(&self, packet: Bytes);

    /// Read the next packet the stack wants to emit (its SYN-ACKs, ACKs,
    /// retransmissions); `None` once the endpoint is closed
    async fn read_outbound(&self) -> Option<Bytes>;

    /// Ordered, idempotent teardown
    fn shutdown(&self);
}

/// One TCP connection accepted by the stack's forwarder
///
/// `complete` signals the forwarder's handshake tracking and must be
/// called exactly once per accept; [`crate::forwarder`] enforces this
/// with a guard. A SYN for a 4-tuple that is already in flight never
/// produces a second accept; the forwarder treats it as handled.
pub trait TcpAccept: Send {
    /// The flow's 4-tuple; the local (destination) side is the address
    /// the intercepted process originally dialed
    fn flow(&self) -> FlowKey;

    /// Create the terminated duplex stream for this connection
    ///
    /// # Errors
    ///
    /// Returns [`StackError::EndpointCreation`] when the endpoint cannot
    /// be created (the handshake machinery is then signalled with
    /// `complete(true)`).
    fn create_stream(&mut self) -> Result<TerminatedConnection, StackError>;

    /// Decrement the forwarder's in-flight counter; `send_rst` aborts
    /// the peer instead of completing quietly
    fn complete(&mut self, send_rst: bool);
}

/// A built stack: the running instance plus its accept channel
pub struct StackHandle {
    /// The stack itself
    pub stack: Arc<dyn NetStack>,
    /// Accepted TCP connections, in handshake-completion order
    pub accepts: mpsc::Receiver<Box<dyn TcpAccept>>,
}

/// Builds the virtual stack during engine startup
///
/// Building acquires real resources (NIC creation, promiscuous and
/// spoofing modes, the default IPv4 route, the TCP forwarder); any
/// failure must leave nothing allocated, so that `start()` can simply
/// propagate the error.
pub trait StackBuilder: Send {
    /// Stand up the stack
    ///
    /// # Errors
    ///
    /// Returns the fatal [`StackError`] that prevented the stack from
    /// coming up, with all partial resources already released.
    fn build(&self, config: &StackConfig) -> Result<StackHandle, StackError>;
}

/// Engine-side driver for the virtual stack
///
/// Owns the stack instance for its lifetime: injects diverted packets,
/// runs the outbound read loop, and funnels every shutdown path through
/// a single guarded teardown.
pub struct StackAdapter {
    stack: Arc<dyn NetStack>,
    capture: Arc<dyn PacketCapture>,
    reply_meta: CaptureMetadata,
    closed: AtomicBool,
}

impl StackAdapter {
    /// Create an adapter bridging the stack and the capture handle
    #[must_use]
    pub fn new(
        stack: Arc<dyn NetStack>,
        capture: Arc<dyn PacketCapture>,
        interface_index: u32,
        sub_interface_index: u32,
    ) -> Self {
        Self {
            stack,
            capture,
            reply_meta: CaptureMetadata::stack_reply(interface_index, sub_interface_index),
            closed: AtomicBool::new(false),
        }
    }

    /// Inject a diverted packet into the stack
    pub fn inject(&self, packet: &InterceptedPacket) {
        self.stack.inject_inbound(packet.data.clone());
    }

    /// Pump stack-emitted packets back to the OS until cancellation or
    /// endpoint close
    ///
    /// Frames are re-injected with IP-checksum recomputation requested
    /// and TCP-checksum validation off; a send failure is logged and the
    /// loop continues (the stack will retransmit).
    pub async fn run_read_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return,
                frame = self.stack.read_outbound() => frame,
            };
            match frame {
                Some(frame) if !frame.is_empty() => {
                    if let Err(e) = self.capture.send(&frame, &self.reply_meta).await {
                        warn!(error = %e, "failed to re-inject stack packet");
                    }
                }
                Some(_) => {}
                None => {
                    debug!("stack link endpoint closed, read loop exiting");
                    return;
                }
            }
        }
    }

    /// Tear the stack down; safe to call any number of times, from any
    /// number of tasks concurrently
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stack.shutdown();
        debug!("virtual stack shut down");
    }

    /// Whether teardown has run
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
