//! Packet classification and diversion
//!
//! Every outbound IPv4+TCP packet the capture driver hands us is either
//! passed back to the OS untouched or diverted into the virtual stack.
//! The rules, in order:
//!
//! 1. Anything that is not a well-formed IPv4+TCP packet passes through
//!    byte-for-byte. Malformed input is never dropped (fail-open).
//! 2. A SYN without ACK is a new outbound connection attempt. The host
//!    connection table is consulted for the owning process: our own
//!    process's connections always pass through; diverting them would
//!    loop the proxy's upstream dials back into itself. Everything else
//!    is recorded in the flow tracker and diverted.
//! 3. Any other TCP segment diverts iff its flow is already tracked
//!    (refreshing the TTL), else passes through.
//!
//! The connection-table lookup is bounded by a timeout; on timeout or
//! lookup failure the packet passes through. Availability beats
//! redirection completeness.

use std::io;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use smoltcp::wire::{IpProtocol, Ipv4Packet, TcpPacket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::capture::{InterceptedPacket, PacketCapture};
use crate::error::ProxyError;
use crate::netstack::StackAdapter;
use crate::tracker::{FlowKey, FlowTracker};

/// Minimum size of an IPv4 header
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Host connection-table collaborator
///
/// Maps a live TCP 4-tuple to the PID of the process that owns it, the
/// way the host OS reports its connection table.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Look up the owning PID of a flow
    ///
    /// `Ok(None)` means the flow is not (yet) in the table; an `Err`
    /// means the table could not be read at all.
    ///
    /// # Errors
    ///
    /// Any `io::Error` from enumerating the host connection table.
    async fn owner_of(&self, flow: &FlowKey) -> io::Result<Option<u32>>;
}

/// Classification outcome for one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Re-inject unmodified; the OS routes it normally
    PassThrough,
    /// Feed into the virtual stack
    Divert,
}

/// Extract the flow key and SYN-only flag from a raw IPv4 frame
///
/// Returns `None` for anything that is not a structurally valid
/// IPv4+TCP packet; the caller treats that as pass-through.
#[must_use]
pub fn parse_tcp_flow(packet: &[u8]) -> Option<(FlowKey, bool)> {
    if packet.len() < IPV4_MIN_HEADER_LEN {
        return None;
    }
    if packet[0] >> 4 != 4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(packet).ok()?;
    if ip.next_header() != IpProtocol::Tcp {
        return None;
    }
    let tcp = TcpPacket::new_checked(ip.payload()).ok()?;

    let key = FlowKey::new(
        SocketAddrV4::new(ip.src_addr(), tcp.src_port()),
        SocketAddrV4::new(ip.dst_addr(), tcp.dst_port()),
    );
    Some((key, tcp.syn() && !tcp.ack()))
}

/// Decides pass-through vs. divert for captured packets
pub struct Classifier {
    own_pid: u32,
    tracker: Arc<FlowTracker>,
    process_table: Arc<dyn ProcessTable>,
    lookup_timeout: Duration,
}

impl Classifier {
    /// Create a classifier for this process
    #[must_use]
    pub fn new(
        tracker: Arc<FlowTracker>,
        process_table: Arc<dyn ProcessTable>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            own_pid: std::process::id(),
            tracker,
            process_table,
            lookup_timeout,
        }
    }

    /// Override the PID considered "our own"
    #[must_use]
    pub fn with_own_pid(mut self, pid: u32) -> Self {
        self.own_pid = pid;
        self
    }

    /// Classify one raw frame
    pub async fn classify(&self, packet: &[u8]) -> Verdict {
        let Some((key, is_syn)) = parse_tcp_flow(packet) else {
            return Verdict::PassThrough;
        };

        if is_syn {
            return self.classify_syn(key).await;
        }

        if self.tracker.is_tracked(&key) {
            Verdict::Divert
        } else {
            Verdict::PassThrough
        }
    }

    async fn classify_syn(&self, key: FlowKey) -> Verdict {
        let lookup = self.process_table.owner_of(&key);
        match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(Ok(Some(pid))) if pid == self.own_pid => {
                trace!(flow = %key, "own connection, passing through");
                Verdict::PassThrough
            }
            Ok(Ok(_)) => {
                // Foreign or unattributed flow: divert. A SYN for an
                // already-tracked key lands here too and simply
                // re-tracks (re-divert, not reclassification).
                self.tracker.track(key);
                trace!(flow = %key, "new connection diverted");
                Verdict::Divert
            }
            Ok(Err(e)) => {
                debug!(flow = %key, error = %e, "connection table lookup failed, passing through");
                Verdict::PassThrough
            }
            Err(_) => {
                debug!(flow = %key, "connection table lookup timed out, passing through");
                Verdict::PassThrough
            }
        }
    }
}

/// Capture read loop: receive, classify, route
///
/// Runs until cancellation. Transient receive errors (undersized buffer)
/// skip the packet; a fatal error is reported once on `failure` and the
/// loop then parks until cancellation: the handle is dead, and
/// restarting against it would spin.
pub async fn run_divert_loop(
    capture: Arc<dyn PacketCapture>,
    classifier: Arc<Classifier>,
    adapter: Arc<StackAdapter>,
    mtu: u32,
    cancel: CancellationToken,
    failure: mpsc::Sender<ProxyError>,
) {
    let mut buf = vec![0u8; mtu as usize];
    loop {
        let (n, meta) = tokio::select! {
            () = cancel.cancelled() => return,
            res = capture.recv(&mut buf) => match res {
                Ok(v) => v,
                Err(e) if e.is_transient() => {
                    trace!(error = %e, "skipping packet");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "capture receive failed, divert loop stopping");
                    let _ = failure.try_send(ProxyError::Capture(e));
                    cancel.cancelled().await;
                    return;
                }
            },
        };
        if n == 0 {
            continue;
        }

        // One private copy before the packet crosses into async handling
        let packet = InterceptedPacket {
            data: Bytes::copy_from_slice(&buf[..n]),
            meta,
        };

        match classifier.classify(&packet.data).await {
            Verdict::Divert => adapter.inject(&packet),
            Verdict::PassThrough => {
                if let Err(e) = capture.send(&packet.data, &packet.meta).await {
                    warn!(error = %e, "pass-through re-injection failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    use crate::tracker::DEFAULT_FLOW_TTL;

    /// Build a minimal IPv4+TCP frame
    fn build_tcp_packet(
        src: SocketAddrV4,
        dst: SocketAddrV4,
        syn: bool,
        ack: bool,
    ) -> Vec<u8> {
        let total_len = 40;
        let mut buf = vec![0u8; total_len];
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip.set_version(4);
            ip.set_header_len(20);
            ip.set_total_len(total_len as u16);
            ip.set_next_header(IpProtocol::Tcp);
            ip.set_hop_limit(64);
            ip.set_src_addr(*src.ip());
            ip.set_dst_addr(*dst.ip());
            ip.fill_checksum();
        }
        {
            let mut tcp = TcpPacket::new_unchecked(&mut buf[20..]);
            tcp.set_src_port(src.port());
            tcp.set_dst_port(dst.port());
            tcp.set_header_len(20);
            tcp.set_syn(syn);
            tcp.set_ack(ack);
        }
        buf
    }

    struct FakeProcessTable {
        owners: HashMap<FlowKey, u32>,
        fail: bool,
        delay: Option<Duration>,
    }

    impl FakeProcessTable {
        fn empty() -> Self {
            Self {
                owners: HashMap::new(),
                fail: false,
                delay: None,
            }
        }

        fn with_owner(flow: FlowKey, pid: u32) -> Self {
            let mut owners = HashMap::new();
            owners.insert(flow, pid);
            Self {
                owners,
                fail: false,
                delay: None,
            }
        }
    }

    #[async_trait]
    impl ProcessTable for FakeProcessTable {
        async fn owner_of(&self, flow: &FlowKey) -> io::Result<Option<u32>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::Other, "table unavailable"));
            }
            Ok(self.owners.get(flow).copied())
        }
    }

    fn flow() -> FlowKey {
        FlowKey::new(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 51000),
            SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443),
        )
    }

    fn classifier(table: FakeProcessTable, tracker: &Arc<FlowTracker>) -> Classifier {
        Classifier::new(
            Arc::clone(tracker),
            Arc::new(table),
            Duration::from_millis(100),
        )
        .with_own_pid(4242)
    }

    #[test]
    fn test_parse_rejects_short_packet() {
        assert!(parse_tcp_flow(&[0x45, 0x00, 0x00]).is_none());
        assert!(parse_tcp_flow(&[]).is_none());
    }

    #[test]
    fn test_parse_rejects_non_ipv4() {
        let mut packet = build_tcp_packet(flow().src, flow().dst, true, false);
        packet[0] = 0x60; // version 6
        assert!(parse_tcp_flow(&packet).is_none());
    }

    #[test]
    fn test_parse_rejects_non_tcp() {
        let mut packet = build_tcp_packet(flow().src, flow().dst, true, false);
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut packet[..]);
            ip.set_next_header(IpProtocol::Udp);
            ip.fill_checksum();
        }
        assert!(parse_tcp_flow(&packet).is_none());
    }

    #[test]
    fn test_parse_extracts_flow_and_syn() {
        let key = flow();
        let packet = build_tcp_packet(key.src, key.dst, true, false);
        let (parsed, syn_only) = parse_tcp_flow(&packet).unwrap();
        assert_eq!(parsed, key);
        assert!(syn_only);

        // SYN-ACK is not a new connection attempt
        let packet = build_tcp_packet(key.src, key.dst, true, true);
        let (_, syn_only) = parse_tcp_flow(&packet).unwrap();
        assert!(!syn_only);
    }

    #[tokio::test]
    async fn test_malformed_packet_passes_through() {
        let tracker = Arc::new(FlowTracker::new(DEFAULT_FLOW_TTL));
        let c = classifier(FakeProcessTable::empty(), &tracker);
        assert_eq!(c.classify(&[0u8; 7]).await, Verdict::PassThrough);
    }

    #[tokio::test]
    async fn test_own_syn_passes_through_even_when_tracked() {
        let key = flow();
        let tracker = Arc::new(FlowTracker::new(DEFAULT_FLOW_TTL));
        // The key being tracked must not override loop avoidance
        tracker.track(key);

        let c = classifier(FakeProcessTable::with_owner(key, 4242), &tracker);
        let packet = build_tcp_packet(key.src, key.dst, true, false);
        assert_eq!(c.classify(&packet).await, Verdict::PassThrough);
    }

    #[tokio::test]
    async fn test_foreign_syn_diverts_and_tracks() {
        let key = flow();
        let tracker = Arc::new(FlowTracker::new(DEFAULT_FLOW_TTL));
        let c = classifier(FakeProcessTable::with_owner(key, 7777), &tracker);

        let packet = build_tcp_packet(key.src, key.dst, true, false);
        assert_eq!(c.classify(&packet).await, Verdict::Divert);
        assert!(tracker.is_tracked(&key));
    }

    #[tokio::test]
    async fn test_unattributed_syn_diverts() {
        let key = flow();
        let tracker = Arc::new(FlowTracker::new(DEFAULT_FLOW_TTL));
        let c = classifier(FakeProcessTable::empty(), &tracker);

        let packet = build_tcp_packet(key.src, key.dst, true, false);
        assert_eq!(c.classify(&packet).await, Verdict::Divert);
    }

    #[tokio::test]
    async fn test_lookup_failure_fails_open() {
        let key = flow();
        let tracker = Arc::new(FlowTracker::new(DEFAULT_FLOW_TTL));
        let mut table = FakeProcessTable::empty();
        table.fail = true;
        let c = classifier(table, &tracker);

        let packet = build_tcp_packet(key.src, key.dst, true, false);
        assert_eq!(c.classify(&packet).await, Verdict::PassThrough);
        assert!(!tracker.is_tracked(&key));
    }

    #[tokio::test]
    async fn test_lookup_timeout_fails_open() {
        let key = flow();
        let tracker = Arc::new(FlowTracker::new(DEFAULT_FLOW_TTL));
        let mut table = FakeProcessTable::empty();
        table.delay = Some(Duration::from_secs(5));
        let c = classifier(table, &tracker);

        let packet = build_tcp_packet(key.src, key.dst, true, false);
        assert_eq!(c.classify(&packet).await, Verdict::PassThrough);
    }

    #[tokio::test]
    async fn test_tracked_segment_diverts() {
        let key = flow();
        let tracker = Arc::new(FlowTracker::new(DEFAULT_FLOW_TTL));
        tracker.track(key);
        let c = classifier(FakeProcessTable::empty(), &tracker);

        let packet = build_tcp_packet(key.src, key.dst, false, true);
        assert_eq!(c.classify(&packet).await, Verdict::Divert);
    }

    #[tokio::test]
    async fn test_untracked_segment_passes_through() {
        let key = flow();
        let tracker = Arc::new(FlowTracker::new(DEFAULT_FLOW_TTL));
        let c = classifier(FakeProcessTable::empty(), &tracker);

        let packet = build_tcp_packet(key.src, key.dst, false, true);
        assert_eq!(c.classify(&packet).await, Verdict::PassThrough);
    }
}
