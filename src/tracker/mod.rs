//! Flow tracking with sliding expiration
//!
//! Once a SYN is classified as "must divert", every later packet of the
//! same flow has to take the divert path without re-classification. The
//! tracker records those decisions as a TTL map over 4-tuples: lookups
//! refresh the deadline (sliding window), a periodic sweep evicts
//! expired entries, and sweep/lookup/insert all serialize on one lock so
//! refresh and eviction can never tear each other.
//!
//! A stopped tracker turns every operation into a no-op instead of an
//! error: callers still in flight during shutdown must not panic.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default sliding TTL for tracked flows
pub const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(30);

/// Default eviction sweep interval
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3);

/// One logical TCP connection attempt as observed on the wire
///
/// Immutable once derived from a packet; for a diverted flow, `dst` is
/// the original destination the owning process dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Source address and port
    pub src: SocketAddrV4,
    /// Destination address and port
    pub dst: SocketAddrV4,
}

impl FlowKey {
    /// Create a flow key from its endpoints
    #[must_use]
    pub const fn new(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self { src, dst }
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// TTL-indexed set of diverted flows
///
/// `None` as the backing store means the tracker has been shut down.
pub struct FlowTracker {
    flows: Mutex<Option<HashMap<FlowKey, Instant>>>,
    ttl: Duration,
}

impl FlowTracker {
    /// Create a tracker with the given sliding TTL
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            flows: Mutex::new(Some(HashMap::new())),
            ttl,
        }
    }

    /// Insert or refresh a flow with a full TTL
    pub fn track(&self, key: FlowKey) {
        let mut guard = self.flows.lock();
        if let Some(flows) = guard.as_mut() {
            flows.insert(key, Instant::now() + self.ttl);
            trace!(flow = %key, "flow tracked");
        }
    }

    /// Whether the flow is tracked; a hit refreshes its deadline
    pub fn is_tracked(&self, key: &FlowKey) -> bool {
        let mut guard = self.flows.lock();
        let Some(flows) = guard.as_mut() else {
            return false;
        };
        match flows.get_mut(key) {
            Some(deadline) => {
                *deadline = Instant::now() + self.ttl;
                true
            }
            None => false,
        }
    }

    /// Remove a flow unconditionally
    pub fn remove(&self, key: &FlowKey) {
        let mut guard = self.flows.lock();
        if let Some(flows) = guard.as_mut() {
            flows.remove(key);
        }
    }

    /// Evict every expired entry
    ///
    /// Runs under the same lock as `track`/`is_tracked`, so a refresh
    /// racing the sweep either lands before the expiration check or
    /// after eviction, never in between.
    pub fn sweep(&self) {
        let mut guard = self.flows.lock();
        let Some(flows) = guard.as_mut() else {
            return;
        };
        let now = Instant::now();
        let before = flows.len();
        flows.retain(|_, deadline| *deadline > now);
        let evicted = before - flows.len();
        if evicted > 0 {
            debug!(evicted, remaining = flows.len(), "flow tracker sweep");
        }
    }

    /// Number of currently tracked flows (0 after shutdown)
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.lock().as_ref().map_or(0, HashMap::len)
    }

    /// Whether no flows are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the backing store; all later operations become no-ops
    pub fn shutdown(&self) {
        let mut guard = self.flows.lock();
        if guard.take().is_some() {
            debug!("flow tracker shut down");
        }
    }

    /// Periodic sweep loop; exits on cancellation
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => self.sweep(),
            }
        }
    }
}

impl Default for FlowTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FLOW_TTL)
    }
}
