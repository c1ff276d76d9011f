//! Shared SOCKS5 protocol constants and address encoding
//!
//! Used by the SOCKS5 transport for its handshake and by the trojan
//! transport, whose header embeds a SOCKS5-style address.

use std::net::SocketAddrV4;

/// SOCKS protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

/// No authentication required
pub const AUTH_METHOD_NONE: u8 = 0x00;
/// Username/password authentication (RFC 1929)
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;
/// No acceptable methods
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;
/// Sub-negotiation version for username/password auth
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;

/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;

/// IPv4 address type
pub const ATYP_IPV4: u8 = 0x01;
/// Domain name address type
pub const ATYP_DOMAIN: u8 = 0x03;
/// IPv6 address type
pub const ATYP_IPV6: u8 = 0x04;

/// Request succeeded
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// Human-readable message for a SOCKS5 reply code
#[must_use]
pub fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// Encode an IPv4 socket address in SOCKS5 form: ATYP | ADDR | PORT
#[must_use]
pub fn encode_socks5_addr(addr: SocketAddrV4) -> Vec<u8> {
    let mut out = Vec::with_capacity(7);
    out.push(ATYP_IPV4);
    out.extend_from_slice(&addr.ip().octets());
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}
