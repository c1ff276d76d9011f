//! Per-connection forwarding sessions
//!
//! One forwarding session runs for every TCP connection the virtual
//! stack accepts: create the terminated endpoint, resolve the true
//! original destination from the flow's local side, obtain an upstream
//! connection through the configured transport, then relay bytes in
//! both directions until either side closes, an error occurs, or
//! shutdown is requested; whichever happens first closes both ends.
//!
//! Failures here are per-connection: they end this session, get logged,
//! and never touch the engine. Whatever path a session takes, the
//! accept's handshake tracking is completed exactly once.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::io::{clamp_buffer_size, relay_with_buffer};
use crate::netstack::TcpAccept;
use crate::outbound::Outbound;

/// Handles accepted connections by bridging them to the upstream
pub struct Forwarder {
    outbound: Arc<dyn Outbound>,
    cancel: CancellationToken,
    buffer_size: usize,
}

impl Forwarder {
    /// Create a forwarder for the configured transport
    #[must_use]
    pub fn new(
        outbound: Arc<dyn Outbound>,
        cancel: CancellationToken,
        buffer_size: usize,
    ) -> Self {
        Self {
            outbound,
            cancel,
            buffer_size: clamp_buffer_size(buffer_size),
        }
    }

    /// Run one forwarding session to completion
    pub async fn handle(&self, accept: Box<dyn TcpAccept>) {
        let mut guard = CompletionGuard::new(accept);
        let flow = guard.accept.flow();

        let mut client = match guard.accept.create_stream() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(flow = %flow, error = %e, "terminated endpoint creation failed");
                guard.abort_with_rst();
                return;
            }
        };

        // The flow's local (destination) side is, by construction of the
        // interception, the address the client originally dialed.
        let target = flow.dst;

        let mut upstream = tokio::select! {
            () = self.cancel.cancelled() => {
                debug!(flow = %flow, "shutdown before upstream connect");
                return;
            }
            result = self.outbound.connect(target) => match result {
                Ok(upstream) => upstream,
                Err(e) => {
                    // No partial relay: the terminated endpoint drops
                    // (closes) right here.
                    warn!(
                        flow = %flow,
                        transport = self.outbound.kind(),
                        error = %e,
                        "upstream connect failed"
                    );
                    return;
                }
            },
        };

        debug!(flow = %flow, transport = self.outbound.kind(), "relay started");

        let result = tokio::select! {
            () = self.cancel.cancelled() => None,
            result = relay_with_buffer(&mut *client, &mut *upstream, self.buffer_size) => {
                Some(result)
            }
        };

        match result {
            Some(result) => debug!(
                flow = %flow,
                up = result.client_to_upstream,
                down = result.upstream_to_client,
                finished = %result.finished,
                error = ?result.error,
                "relay finished"
            ),
            None => debug!(flow = %flow, "relay cancelled by shutdown"),
        }
        // Both streams drop here, closing them and unblocking whatever
        // the other direction was waiting on.
    }
}

/// Completes an accept exactly once, on every exit path
struct CompletionGuard {
    accept: Box<dyn TcpAccept>,
    send_rst: bool,
    done: bool,
}

impl CompletionGuard {
    fn new(accept: Box<dyn TcpAccept>) -> Self {
        Self {
            accept,
            send_rst: false,
            done: false,
        }
    }

    /// Complete with an RST on drop (endpoint creation failed)
    fn abort_with_rst(&mut self) {
        self.send_rst = true;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.done {
            self.done = true;
            self.accept.complete(self.send_rst);
        }
    }
}
