//! Error types for transparent-proxy
//!
//! This module defines the error hierarchy for the interception engine.
//! Errors are categorized by subsystem; the taxonomy follows the failure
//! semantics of the engine: malformed input is never an error (the packet
//! path fails open), resource acquisition errors are fatal to startup,
//! per-connection errors stay local to one forwarding session, and
//! shutdown races are defined away as no-ops.

use std::io;

use thiserror::Error;

/// Top-level error type for transparent-proxy
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration errors (file parsing, validation, proxy URLs)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Packet capture handle errors
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Virtual network stack errors
    #[error("Stack error: {0}")]
    Stack(#[from] StackError),

    /// Upstream transport errors
    #[error("Outbound error: {0}")]
    Outbound(#[from] OutboundError),

    /// Lifecycle state machine violation (e.g. `start()` called twice)
    #[error("Invalid engine state: {0}")]
    InvalidState(&'static str),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Proxy endpoint URL could not be parsed
    #[error("Invalid proxy URL {url:?}: {reason}")]
    InvalidProxyUrl { url: String, reason: String },

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    Io(#[from] io::Error),
}

impl ConfigError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// Create an invalid-URL error
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProxyUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Packet capture handle errors
///
/// The capture driver itself is a host collaborator; these errors describe
/// the boundary the engine observes through the
/// [`crate::capture::PacketCapture`] trait.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Opening the capture handle failed (fatal to startup)
    #[error("Failed to open capture handle with filter {filter:?}: {reason}")]
    OpenFailed { filter: String, reason: String },

    /// The receive buffer was too small for the packet; skip and continue
    #[error("Capture receive buffer too small")]
    InsufficientBuffer,

    /// The handle has been shut down; the read loop must exit
    #[error("Capture handle closed")]
    Closed,

    /// Receive failed for another reason
    #[error("Capture receive failed: {0}")]
    Recv(String),

    /// Re-injection failed
    #[error("Capture send failed: {0}")]
    Send(String),
}

impl CaptureError {
    /// Whether the divert loop can continue after this error
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::InsufficientBuffer | Self::Send(_))
    }
}

/// Virtual network stack errors
#[derive(Debug, Error)]
pub enum StackError {
    /// NIC creation failed (fatal to startup)
    #[error("Failed to create virtual NIC: {0}")]
    NicCreation(String),

    /// Enabling a NIC mode (promiscuous, spoofing) failed (fatal to startup)
    #[error("Failed to enable {mode} mode: {reason}")]
    Mode { mode: &'static str, reason: String },

    /// TCP forwarder registration failed (fatal to startup)
    #[error("Failed to register TCP forwarder: {0}")]
    Forwarder(String),

    /// Endpoint creation for an accepted connection failed (per-connection)
    #[error("Failed to create TCP endpoint: {0}")]
    EndpointCreation(String),

    /// The stack has been destroyed
    #[error("Virtual stack closed")]
    Closed,
}

/// Upstream transport errors
///
/// These are per-connection: they end one forwarding session and are
/// reported through tracing, never fatal to the engine.
#[derive(Debug, Error)]
pub enum OutboundError {
    /// TCP connection to the proxy server (or direct target) failed
    #[error("Connection to {addr} failed: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Dial or handshake exceeded the configured timeout
    #[error("Connection to {addr} timed out after {timeout_secs}s")]
    Timeout { addr: String, timeout_secs: u64 },

    /// Protocol handshake failed (malformed reply, auth failure, ...)
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The proxy server rejected the request; the message is the exact
    /// response body returned by the server
    #[error("{message}")]
    Rejected { message: String },

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// The engine is shutting down; the dial was abandoned
    #[error("Connect cancelled by shutdown")]
    Cancelled,

    /// Underlying I/O failure during handshake
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl OutboundError {
    /// Create a connection-failed error
    pub fn connection_failed(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(addr: impl Into<String>, timeout_secs: u64) -> Self {
        Self::Timeout {
            addr: addr.into(),
            timeout_secs,
        }
    }

    /// Create a handshake error
    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::Handshake(reason.into())
    }

    /// Create a rejection error from a server response body
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}
