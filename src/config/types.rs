//! Configuration types for transparent-proxy
//!
//! This module defines all configuration structures used by the engine.
//! Configuration is loaded from JSON files and validated at startup; the
//! selected [`ProxyConfig`] is immutable afterwards and shared by
//! reference across all forwarding tasks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::url::{parse_proxy_url, ProxyEndpoint};
use crate::error::ConfigError;
use crate::io::buffer::{DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Selected upstream transport
    pub proxy: ProxyConfig,

    /// Capture interface parameters
    pub capture: CaptureConfig,

    /// Per-connection limits and timeouts
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Flow tracker tuning
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Logging configuration (consumed by the host when installing a
    /// subscriber; the library itself only emits events)
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any section fails validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy.validate()?;
        self.capture.validate()?;
        self.connection.validate()?;
        self.tracker.validate()?;
        Ok(())
    }
}

/// Upstream transport selection
///
/// A tagged union over the supported transport kinds. Exactly one is
/// chosen at startup; each variant carries its own connection parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyConfig {
    /// No proxy: dial the original destination directly
    None,

    /// HTTP CONNECT proxy
    Http {
        /// `http://[user:password@]host:port`
        url: String,
    },

    /// SOCKS5 proxy with optional username/password auth
    Socks5 {
        /// `socks5://[user:password@]host:port`
        url: String,
    },

    /// Trojan-style TLS proxy with SHA-224 token auth
    Trojan {
        /// Server address in `host:port` form
        server: String,
        /// Shared secret
        password: String,
        /// TLS SNI / Host domain; defaults to the server host
        #[serde(default)]
        domain: Option<String>,
        /// Reserved for WebSocket transport mode
        #[serde(default)]
        path: Option<String>,
        /// Skip server certificate verification
        #[serde(default)]
        skip_cert_verify: bool,
    },

    /// Framed transport with per-chunk AES-GCM encryption
    Bss {
        /// `bss://host:port`
        url: String,
        /// AES key; must be 16, 24 or 32 bytes
        key: String,
    },

    /// Framed transport with a plaintext handshake and raw relay
    Oks {
        /// `oks://host:port`
        url: String,
    },
}

impl ProxyConfig {
    /// Short name of the selected transport kind
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Http { .. } => "http",
            Self::Socks5 { .. } => "socks5",
            Self::Trojan { .. } => "trojan",
            Self::Bss { .. } => "bss",
            Self::Oks { .. } => "oks",
        }
    }

    /// Parse the endpoint URL for URL-based variants
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a malformed URL; `Ok(None)` for variants
    /// that do not carry one (`None`, `Trojan`).
    pub fn endpoint(&self) -> Result<Option<ProxyEndpoint>, ConfigError> {
        match self {
            Self::Http { url } | Self::Socks5 { url } | Self::Bss { url, .. } | Self::Oks { url } => {
                parse_proxy_url(url).map(Some)
            }
            Self::None | Self::Trojan { .. } => Ok(None),
        }
    }

    /// Validate the variant's parameters
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` on malformed URLs, an empty trojan password
    /// or server, or a `bss` key that is not 16/24/32 bytes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;
        match self {
            Self::Trojan {
                server, password, ..
            } => {
                if server.is_empty() {
                    return Err(ConfigError::validation("trojan server must not be empty"));
                }
                let Some((host, port)) = server.rsplit_once(':') else {
                    return Err(ConfigError::validation(format!(
                        "trojan server {server:?} must be host:port"
                    )));
                };
                if host.is_empty() || port.parse::<u16>().is_err() {
                    return Err(ConfigError::validation(format!(
                        "trojan server {server:?} must be host:port"
                    )));
                }
                if password.is_empty() {
                    return Err(ConfigError::validation("trojan password must not be empty"));
                }
            }
            Self::Bss { key, .. } => {
                if !matches!(key.len(), 16 | 24 | 32) {
                    return Err(ConfigError::validation(format!(
                        "bss key must be 16, 24 or 32 bytes, got {}",
                        key.len()
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Capture interface parameters
///
/// The interface and sub-interface indices are discovered by the host
/// (the capture driver collaborator) and handed to the engine; the MTU
/// sizes the packet buffers and the virtual link endpoint.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct CaptureConfig {
    /// Network interface index to intercept on
    pub interface_index: u32,

    /// Sub-interface index
    #[serde(default)]
    pub sub_interface_index: u32,

    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

fn default_mtu() -> u32 {
    1500
}

impl CaptureConfig {
    /// Validate capture parameters
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the MTU is below the IPv4 minimum (576).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu < 576 {
            return Err(ConfigError::validation(format!(
                "mtu {} is below the IPv4 minimum of 576",
                self.mtu
            )));
        }
        Ok(())
    }
}

/// Per-connection limits and timeouts
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Upstream dial + handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Host connection-table lookup timeout in milliseconds
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_ms: u64,

    /// Relay buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_lookup_timeout() -> u64 {
    500
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl ConnectionConfig {
    /// Upstream dial timeout as a `Duration`
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Connection-table lookup timeout as a `Duration`
    #[must_use]
    pub const fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    /// Validate connection parameters
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the buffer size is outside the supported
    /// range or a timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::validation("connect_timeout_secs must be > 0"));
        }
        if self.buffer_size < MIN_BUFFER_SIZE || self.buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError::validation(format!(
                "buffer_size {} outside [{MIN_BUFFER_SIZE}, {MAX_BUFFER_SIZE}]",
                self.buffer_size
            )));
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            lookup_timeout_ms: default_lookup_timeout(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Flow tracker tuning
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TrackerConfig {
    /// Sliding TTL for tracked flows, in seconds
    #[serde(default = "default_flow_ttl")]
    pub ttl_secs: u64,

    /// Eviction sweep interval, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_flow_ttl() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    3
}

impl TrackerConfig {
    /// Flow TTL as a `Duration`
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sweep interval as a `Duration`
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Validate tracker parameters
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if either interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_secs == 0 {
            return Err(ConfigError::validation("tracker ttl_secs must be > 0"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::validation(
                "tracker sweep_interval_secs must be > 0",
            ));
        }
        Ok(())
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_flow_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
