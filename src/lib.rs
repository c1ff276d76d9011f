//! transparent-proxy: transparent TCP interception engine
//!
//! This crate intercepts a host's outbound TCP traffic at the packet
//! level, re-terminates each connection inside a private user-space
//! network stack, and relays the resulting byte stream through one of
//! several pluggable upstream transports (direct, HTTP CONNECT, SOCKS5,
//! trojan-style TLS, and two custom framed protocols).
//!
//! # Architecture
//!
//! ```text
//! OS packet ──► Classifier ──► pass-through ──► OS
//!                   │
//!                   ▼ divert
//!            Virtual stack (TCP termination)
//!                   │ accept
//!                   ▼
//!              Forwarder ──► Outbound transport ──► upstream
//!                   ▲                                   │
//!                   └──── bidirectional relay ◄─────────┘
//! ```
//!
//! The OS packet capture driver, the host connection table, and the
//! user-space network stack are host collaborators injected behind
//! narrow traits ([`capture::PacketCapture`], [`divert::ProcessTable`],
//! [`netstack::NetStack`]); the engine owns everything in between.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use transparent_proxy::config::load_config;
//! use transparent_proxy::engine::ProxyEngine;
//! # use transparent_proxy::capture::CaptureBuilder;
//! # use transparent_proxy::netstack::StackBuilder;
//! # use transparent_proxy::divert::ProcessTable;
//!
//! # async fn example(
//! #     capture: Box<dyn CaptureBuilder>,
//! #     stack: Box<dyn StackBuilder>,
//! #     processes: Arc<dyn ProcessTable>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/transparent-proxy/config.json")?;
//! let engine = ProxyEngine::new(config, capture, stack, processes)?;
//!
//! let mut done = engine.start()?;
//! tokio::select! {
//!     err = done.recv() => eprintln!("proxy died: {err:?}"),
//!     _ = tokio::signal::ctrl_c() => {}
//! }
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`capture`]: packet capture boundary (driver collaborator traits)
//! - [`config`]: configuration types and loading
//! - [`divert`]: packet classification and the divert loop
//! - [`engine`]: lifecycle boundary (`start`/`stop`)
//! - [`error`]: error types
//! - [`forwarder`]: per-connection relay sessions
//! - [`io`]: relay buffers and the bidirectional relay future
//! - [`lifecycle`]: task supervision and coordinated shutdown
//! - [`netstack`]: virtual stack boundary and adapter
//! - [`outbound`]: upstream transport implementations
//! - [`tracker`]: diverted-flow TTL tracking

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod capture;
pub mod config;
pub mod divert;
pub mod engine;
pub mod error;
pub mod forwarder;
pub mod io;
pub mod lifecycle;
pub mod netstack;
pub mod outbound;
pub mod tracker;

// Re-export commonly used types at the crate root
pub use capture::{capture_filter, CaptureBuilder, CaptureMetadata, InterceptedPacket, PacketCapture};
pub use config::{load_config, load_config_str, Config, ProxyConfig};
pub use divert::{Classifier, ProcessTable, Verdict};
pub use engine::ProxyEngine;
pub use error::{CaptureError, ConfigError, OutboundError, ProxyError, StackError};
pub use forwarder::Forwarder;
pub use lifecycle::TaskManager;
pub use netstack::{NetStack, StackAdapter, StackBuilder, StackConfig, StackHandle, TcpAccept};
pub use outbound::{build_outbound, Outbound, UpstreamConnection};
pub use tracker::{FlowKey, FlowTracker};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
