//! End-to-end interception scenario
//!
//! Drives the whole pipeline with mocked host collaborators: a capture
//! handle fed from the test, a virtual stack that terminates diverted
//! SYNs into duplex streams, and a real TCP test server speaking the
//! "oks" framed protocol.
//!
//! The scenario: a SYN for `10.0.0.5:51000 -> 93.184.216.34:443`, not
//! owned by the proxy process, is diverted; the stack completes the
//! handshake; the forwarder connects to the test server, sends the
//! destination as a length-prefixed frame, receives `"ok"`, and then
//! relays application payload byte-for-byte in both directions.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use smoltcp::wire::{IpProtocol, Ipv4Packet, TcpPacket};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use transparent_proxy::capture::{CaptureBuilder, CaptureMetadata, PacketCapture};
use transparent_proxy::config::load_config_str;
use transparent_proxy::divert::ProcessTable;
use transparent_proxy::engine::ProxyEngine;
use transparent_proxy::error::{CaptureError, StackError};
use transparent_proxy::netstack::{
    NetStack, StackBuilder, StackConfig, StackHandle, TcpAccept, TerminatedConnection,
};
use transparent_proxy::tracker::FlowKey;

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ---------------------------------------------------------------------
// Packet helpers
// ---------------------------------------------------------------------

fn build_tcp_packet(src: SocketAddrV4, dst: SocketAddrV4, syn: bool, ack: bool) -> Vec<u8> {
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

fn captured_meta() -> CaptureMetadata {
    CaptureMetadata {
        interface_index: 4,
        sub_interface_index: 0,
        outbound: true,
        loopback: false,
        impostor: false,
        recompute_ip_checksum: false,
        validate_tcp_checksum: false,
    }
}

// ---------------------------------------------------------------------
// Mock capture handle
// ---------------------------------------------------------------------

struct MockCapture {
    incoming: tokio::sync::Mutex<mpsc::Receiver<(Vec<u8>, CaptureMetadata)>>,
    sent: Mutex<Vec<(Vec<u8>, CaptureMetadata)>>,
    closed: CancellationToken,
}

#[async_trait]
impl PacketCapture for MockCapture {
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, CaptureMetadata), CaptureError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => Err(CaptureError::Closed),
            packet = incoming.recv() => match packet {
                Some((data, meta)) => {
                    if data.len() > buf.len() {
                        return Err(CaptureError::InsufficientBuffer);
                    }
                    buf[..data.len()].copy_from_slice(&data);
                    Ok((data.len(), meta))
                }
                None => Err(CaptureError::Closed),
            },
        }
    }

    async fn send(&self, packet: &[u8], meta: &CaptureMetadata) -> Result<(), CaptureError> {
        self.sent.lock().push((packet.to_vec(), *meta));
        Ok(())
    }

    fn shutdown(&self) {
        self.closed.cancel();
    }

    fn close(&self) {}
}

struct MockCaptureBuilder {
    capture: Mutex<Option<Arc<MockCapture>>>,
    feed: Mutex<Option<mpsc::Sender<(Vec<u8>, CaptureMetadata)>>>,
}

impl MockCaptureBuilder {
    fn new() -> Self {
        Self {
            capture: Mutex::new(None),
            feed: Mutex::new(None),
        }
    }
}

impl CaptureBuilder for MockCaptureBuilder {
    fn open(&self, filter: &str) -> Result<Arc<dyn PacketCapture>, CaptureError> {
        assert!(filter.contains("ip and tcp and outbound"));
        let (tx, rx) = mpsc::channel(64);
        let capture = Arc::new(MockCapture {
            incoming: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
        });
        *self.capture.lock() = Some(Arc::clone(&capture));
        *self.feed.lock() = Some(tx);
        Ok(capture)
    }
}

// ---------------------------------------------------------------------
// Mock virtual stack
// ---------------------------------------------------------------------

struct MockAccept {
    flow: FlowKey,
    stream: Option<DuplexStream>,
    completions: Arc<AtomicUsize>,
}

impl TcpAccept for MockAccept {
    fn flow(&self) -> FlowKey {
        self.flow
    }

    fn create_stream(&mut self) -> Result<TerminatedConnection, StackError> {
        Ok(Box::new(self.stream.take().expect("stream taken twice")))
    }

    fn complete(&mut self, _send_rst: bool) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }
}

/// A stack that "terminates" every diverted SYN: it hands an accept to
/// the engine and keeps the peer end of the duplex pair for the test to
/// speak through, as the intercepted application would.
struct MockStack {
    accepts_tx: mpsc::Sender<Box<dyn TcpAccept>>,
    /// Peer ends of terminated connections, keyed by flow
    peers: Mutex<HashMap<FlowKey, DuplexStream>>,
    /// In-flight flows; a duplicate SYN is treated as handled
    in_flight: Mutex<HashMap<FlowKey, ()>>,
    /// Frames the stack wants to emit back to the OS
    outbound_tx: mpsc::Sender<Bytes>,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    completions: Arc<AtomicUsize>,
    shutdowns: AtomicUsize,
    closed: CancellationToken,
}

#[async_trait]
impl NetStack for MockStack {
    fn inject_inbound(&self, packet: Bytes) {
        let Some((flow, syn_only)) = parse_flow(&packet) else {
            return;
        };
        if !syn_only {
            return;
        }
        // Duplicate SYN for an in-flight flow: ignore and treat as
        // handled, no second accept.
        if self.in_flight.lock().insert(flow, ()).is_some() {
            return;
        }

        let (terminated, peer) = duplex(64 * 1024);
        self.peers.lock().insert(flow, peer);
        self.accepts_tx
            .try_send(Box::new(MockAccept {
                flow,
                stream: Some(terminated),
                completions: Arc::clone(&self.completions),
            }))
            .expect("accept channel full");

        // Emit a synthetic handshake reply frame for the adapter's
        // outbound path.
        let reply = build_tcp_packet(flow.dst, flow.src, true, true);
        let _ = self.outbound_tx.try_send(Bytes::from(reply));
    }

    async fn read_outbound(&self) -> Option<Bytes> {
        let mut rx = self.outbound_rx.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => None,
            frame = rx.recv() => frame,
        }
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }
}

fn parse_flow(packet: &[u8]) -> Option<(FlowKey, bool)> {
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

struct MockStackBuilder {
    stack: Mutex<Option<Arc<MockStack>>>,
}

impl StackBuilder for MockStackBuilder {
    fn build(&self, config: &StackConfig) -> Result<StackHandle, StackError> {
        assert_eq!(config.mtu, 1500);
        let (accepts_tx, accepts_rx) = mpsc::channel(config.channel_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.channel_capacity);
        let stack = Arc::new(MockStack {
            accepts_tx,
            peers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            completions: Arc::new(AtomicUsize::new(0)),
            shutdowns: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        });
        *self.stack.lock() = Some(Arc::clone(&stack));
        Ok(StackHandle {
            stack,
            accepts: accepts_rx,
        })
    }
}

// ---------------------------------------------------------------------
// Process table
// ---------------------------------------------------------------------

struct ForeignProcessTable;

#[async_trait]
impl ProcessTable for ForeignProcessTable {
    async fn owner_of(&self, _flow: &FlowKey) -> io::Result<Option<u32>> {
        // Some other process owns every flow in this scenario
        Ok(Some(31337))
    }
}

// ---------------------------------------------------------------------
// "oks" test server
// ---------------------------------------------------------------------

/// Accepts one connection, validates the length-prefixed destination,
/// replies "ok", then echoes payload.
async fn run_oks_server(listener: TcpListener, expected_target: String) {
    let (mut socket, _) = listener.accept().await.unwrap();

    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    assert!(len > 0, "empty handshake frame");
    let mut target = vec![0u8; len];
    socket.read_exact(&mut target).await.unwrap();
    assert_eq!(String::from_utf8(target).unwrap(), expected_target);

    socket.write_all(&2u32.to_be_bytes()).await.unwrap();
    socket.write_all(b"ok").await.unwrap();

    let mut buf = [0u8; 4096];
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
}

// ---------------------------------------------------------------------
// The scenario
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_oks_end_to_end() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    let server = tokio::spawn(run_oks_server(listener, "93.184.216.34:443".to_string()));

    let config = load_config_str(&format!(
        r#"{{
            "proxy": {{ "type": "oks", "url": "oks://{server_addr}" }},
            "capture": {{ "interface_index": 4, "mtu": 1500 }}
        }}"#
    ))
    .unwrap();

    let capture_builder = Arc::new(MockCaptureBuilder::new());
    let stack_builder = Arc::new(MockStackBuilder {
        stack: Mutex::new(None),
    });

    struct CaptureProxy(Arc<MockCaptureBuilder>);
    impl CaptureBuilder for CaptureProxy {
        fn open(&self, filter: &str) -> Result<Arc<dyn PacketCapture>, CaptureError> {
            self.0.open(filter)
        }
    }
    struct StackProxy(Arc<MockStackBuilder>);
    impl StackBuilder for StackProxy {
        fn build(&self, config: &StackConfig) -> Result<StackHandle, StackError> {
            self.0.build(config)
        }
    }

    let engine = ProxyEngine::new(
        config,
        Box::new(CaptureProxy(Arc::clone(&capture_builder))),
        Box::new(StackProxy(Arc::clone(&stack_builder))),
        Arc::new(ForeignProcessTable),
    )
    .unwrap();

    let _done = engine.start().unwrap();

    let capture = capture_builder.capture.lock().clone().unwrap();
    let feed = capture_builder.feed.lock().clone().unwrap();
    let stack = stack_builder.stack.lock().clone().unwrap();

    let flow = FlowKey::new(
        "10.0.0.5:51000".parse().unwrap(),
        "93.184.216.34:443".parse().unwrap(),
    );

    // A malformed packet passes through byte-for-byte, unmodified.
    let runt = vec![0xAA, 0xBB, 0xCC];
    feed.send((runt.clone(), captured_meta())).await.unwrap();

    // The SYN for the scenario flow is diverted into the stack. A
    // duplicate SYN must be ignored (no second accept).
    let syn = build_tcp_packet(flow.src, flow.dst, true, false);
    feed.send((syn.clone(), captured_meta())).await.unwrap();
    feed.send((syn, captured_meta())).await.unwrap();

    // Wait for the stack to terminate the connection.
    let mut terminated_peer = None;
    for _ in 0..100 {
        if let Some(peer) = stack.peers.lock().remove(&flow) {
            terminated_peer = Some(peer);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let mut peer = terminated_peer.expect("SYN was not diverted into the stack");

    // Application payload relays byte-for-byte in both directions
    // (the oks server echoes).
    peer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut echoed = [0u8; 18];
    tokio::time::timeout(Duration::from_secs(2), peer.read_exact(&mut echoed))
        .await
        .expect("no echo from upstream")
        .unwrap();
    assert_eq!(&echoed, b"GET / HTTP/1.1\r\n\r\n");

    assert_eq!(
        stack.in_flight.lock().len(),
        1,
        "duplicate SYN created a second in-flight entry"
    );

    // The runt packet went back to the OS unmodified, and the stack's
    // synthetic reply was re-injected with the checksum asymmetry.
    let mut saw_runt = false;
    let mut saw_stack_reply = false;
    for _ in 0..100 {
        {
            let sent = capture.sent.lock();
            saw_runt = sent
                .iter()
                .any(|(data, meta)| *data == runt && !meta.recompute_ip_checksum);
            saw_stack_reply = sent
                .iter()
                .any(|(_, meta)| meta.recompute_ip_checksum && !meta.validate_tcp_checksum);
        }
        if saw_runt && saw_stack_reply {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(saw_runt, "malformed packet was not passed through unmodified");
    assert!(saw_stack_reply, "stack reply was not re-injected");

    // Close the application side; the session winds down and completes
    // its accept exactly once.
    peer.shutdown().await.unwrap();
    drop(peer);

    for _ in 0..100 {
        if stack.completions.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stack.completions.load(Ordering::SeqCst), 1);

    engine.stop().await;
    assert_eq!(
        stack.shutdowns.load(Ordering::SeqCst),
        1,
        "stack teardown did not run exactly once"
    );

    server.await.unwrap();
}

#[tokio::test]
async fn test_untracked_segment_passes_through() {
    init_tracing();
    let config = load_config_str(
        r#"{
            "proxy": { "type": "none" },
            "capture": { "interface_index": 4, "mtu": 1500 }
        }"#,
    )
    .unwrap();

    let capture_builder = Arc::new(MockCaptureBuilder::new());
    let stack_builder = Arc::new(MockStackBuilder {
        stack: Mutex::new(None),
    });

    struct CaptureProxy(Arc<MockCaptureBuilder>);
    impl CaptureBuilder for CaptureProxy {
        fn open(&self, filter: &str) -> Result<Arc<dyn PacketCapture>, CaptureError> {
            self.0.open(filter)
        }
    }
    struct StackProxy(Arc<MockStackBuilder>);
    impl StackBuilder for StackProxy {
        fn build(&self, config: &StackConfig) -> Result<StackHandle, StackError> {
            self.0.build(config)
        }
    }

    let engine = ProxyEngine::new(
        config,
        Box::new(CaptureProxy(Arc::clone(&capture_builder))),
        Box::new(StackProxy(Arc::clone(&stack_builder))),
        Arc::new(ForeignProcessTable),
    )
    .unwrap();
    let _done = engine.start().unwrap();

    let capture = capture_builder.capture.lock().clone().unwrap();
    let feed = capture_builder.feed.lock().clone().unwrap();

    // A non-SYN segment for an untracked flow goes straight back out.
    let packet = build_tcp_packet(
        "10.0.0.5:51001".parse().unwrap(),
        "1.1.1.1:443".parse().unwrap(),
        false,
        true,
    );
    feed.send((packet.clone(), captured_meta())).await.unwrap();

    let mut passed = false;
    for _ in 0..100 {
        if capture.sent.lock().iter().any(|(data, _)| *data == packet) {
            passed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(passed, "untracked segment was not passed through");

    engine.stop().await;
}
