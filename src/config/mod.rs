//! Configuration types and loading
//!
//! The engine is configured once at startup: a selected upstream
//! transport ([`ProxyConfig`]), the capture interface parameters, and
//! tuning for connections and the flow tracker. Proxy endpoints are
//! given as URLs and parsed during validation.

mod loader;
mod types;
mod url;

pub use loader::{load_config, load_config_str, load_config_with_env};
pub use types::{
    CaptureConfig, Config, ConnectionConfig, LogConfig, ProxyConfig, TrackerConfig,
};
pub use url::{parse_proxy_url, ProxyAuth, ProxyEndpoint, DEFAULT_PROXY_PORT};
