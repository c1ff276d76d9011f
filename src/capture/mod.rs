//! Packet capture boundary
//!
//! The OS-level capture driver is a host collaborator: it owns the
//! kernel hook and exposes receive/send/shutdown primitives. This module
//! defines that boundary as traits the engine drives, the metadata that
//! travels with every packet, and the filter expression the host passes
//! to its driver.
//!
//! The engine never interprets the driver's internals; it only relies on
//! three properties: `recv` blocks until a packet or shutdown, `send`
//! re-injects a raw IPv4 frame with the given metadata, and `shutdown`
//! unblocks any pending `recv` so the read loop can observe cancellation.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CaptureError;

/// Build the capture filter for one interface
///
/// Selects IPv4 + TCP, outbound, non-loopback traffic on the given
/// interface index, the only traffic the classifier ever needs to see.
#[must_use]
pub fn capture_filter(interface_index: u32) -> String {
    format!("ifIdx = {interface_index} and ip and tcp and outbound and not loopback")
}

/// Direction and checksum metadata attached to a captured packet
///
/// The same structure is used for re-injection. Note the deliberate
/// checksum asymmetry on stack replies: IP checksums are recomputed by
/// the driver, TCP checksum validation stays off (the virtual stack or
/// hardware offload owns it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureMetadata {
    /// Interface index the packet was seen on
    pub interface_index: u32,
    /// Sub-interface index
    pub sub_interface_index: u32,
    /// True for host-originated (outbound) packets
    pub outbound: bool,
    /// True for loopback traffic
    pub loopback: bool,
    /// True when the packet was injected by this process
    pub impostor: bool,
    /// Ask the driver to recompute the IPv4 header checksum on send
    pub recompute_ip_checksum: bool,
    /// Ask the driver to validate TCP checksums
    pub validate_tcp_checksum: bool,
}

impl CaptureMetadata {
    /// Metadata for re-injecting a stack-emitted reply as inbound traffic
    #[must_use]
    pub fn stack_reply(interface_index: u32, sub_interface_index: u32) -> Self {
        Self {
            interface_index,
            sub_interface_index,
            outbound: false,
            loopback: false,
            impostor: false,
            recompute_ip_checksum: true,
            validate_tcp_checksum: false,
        }
    }
}

/// A captured packet: one private copy of the driver's buffer plus its
/// metadata
///
/// The copy is taken exactly once, before the packet crosses into any
/// async task, so nothing aliases the driver's scratch buffer.
#[derive(Debug, Clone)]
pub struct InterceptedPacket {
    /// Raw IPv4 frame
    pub data: Bytes,
    /// Capture metadata, reused verbatim for pass-through re-injection
    pub meta: CaptureMetadata,
}

/// An open capture handle
///
/// Implementations wrap the host's packet capture driver. All methods
/// must tolerate being called during or after shutdown: `shutdown` and
/// `close` are idempotent, and a `recv` pending across `shutdown`
/// resolves to [`CaptureError::Closed`].
#[async_trait]
pub trait PacketCapture: Send + Sync {
    /// Receive one packet into `buf`, returning its length and metadata
    ///
    /// # Errors
    ///
    /// [`CaptureError::InsufficientBuffer`] when the packet did not fit
    /// (the caller skips it), [`CaptureError::Closed`] once the handle is
    /// shut down, [`CaptureError::Recv`] otherwise.
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, CaptureMetadata), CaptureError>;

    /// Re-inject a raw frame with the given metadata
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Send`] if the driver rejects the frame.
    async fn send(&self, packet: &[u8], meta: &CaptureMetadata) -> Result<(), CaptureError>;

    /// Unblock pending receives; idempotent
    fn shutdown(&self);

    /// Release the handle; idempotent
    fn close(&self);
}

/// Opens capture handles
///
/// Splitting the open from the handle keeps resource acquisition inside
/// `ProxyEngine::start()`, where an open failure is fatal and unwinding
/// is well defined.
pub trait CaptureBuilder: Send {
    /// Open a capture handle for the given filter expression
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::OpenFailed`] when the driver rejects the
    /// filter or the handle cannot be created.
    fn open(&self, filter: &str) -> Result<std::sync::Arc<dyn PacketCapture>, CaptureError>;
}
