//! Direct (no-proxy) outbound
//!
//! Used when no upstream proxy is configured: the terminated connection
//! is bridged straight to the original destination.

use std::net::SocketAddrV4;
use std::time::Duration;

use async_trait::async_trait;

use super::traits::{dial_server, Outbound, UpstreamConnection};
use crate::error::OutboundError;

/// Direct TCP dial to the original destination
#[derive(Debug, Clone)]
pub struct DirectOutbound {
    connect_timeout: Duration,
}

impl DirectOutbound {
    /// Create a direct outbound with the given dial timeout
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Outbound for DirectOutbound {
    async fn connect(&self, target: SocketAddrV4) -> Result<UpstreamConnection, OutboundError> {
        let stream = dial_server(&target.to_string(), self.connect_timeout).await?;
        Ok(Box::new(stream))
    }

    fn kind(&self) -> &'static str {
        "direct"
    }
}
