//! Tunnel configuration.
//!
//! Settings come from code, from a `KEY=VALUE` block (the format of an
//! `.env` file) or from the process environment:
//!
//! ```text
//! KNX_GATEWAY_IP=192.168.1.10
//! KNX_GATEWAY_PORT=3671
//! KNX_CONNECT_TIMEOUT_MS=5000
//! KNX_READ_TIMEOUT_MS=3000
//! ```
//!
//! A timeout of `0` disables it, so the call blocks until the gateway
//! answers.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use crate::error::{KnxError, Result};
use crate::protocol::constants::KNXNETIP_DEFAULT_PORT;

/// Gateway address key (required)
pub const KEY_GATEWAY_IP: &str = "KNX_GATEWAY_IP";
/// Gateway port key
pub const KEY_GATEWAY_PORT: &str = "KNX_GATEWAY_PORT";
/// Connect timeout key, in milliseconds
pub const KEY_CONNECT_TIMEOUT_MS: &str = "KNX_CONNECT_TIMEOUT_MS";
/// Read timeout key, in milliseconds
pub const KEY_READ_TIMEOUT_MS: &str = "KNX_READ_TIMEOUT_MS";

/// Default wait for `CONNECT_RESPONSE` and `DISCONNECT_RESPONSE`
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default wait for a group read response
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Where to find the gateway and how long to wait for it.
///
/// ```
/// use std::net::Ipv4Addr;
/// use std::time::Duration;
/// use knx_tunnel::TunnelConfig;
///
/// let config = TunnelConfig::new(Ipv4Addr::new(192, 168, 1, 10))
///     .with_read_timeout(Some(Duration::from_millis(500)));
/// assert_eq!(config.gateway.port(), 3671);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Gateway control endpoint
    pub gateway: SocketAddrV4,
    /// Wait for the handshake; `None` blocks indefinitely
    pub connect_timeout: Option<Duration>,
    /// Wait for a group read response; `None` blocks indefinitely
    pub read_timeout: Option<Duration>,
}

impl TunnelConfig {
    /// Configuration for a gateway on the standard port.
    pub const fn new(gateway_ip: Ipv4Addr) -> Self {
        Self {
            gateway: SocketAddrV4::new(gateway_ip, KNXNETIP_DEFAULT_PORT),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
        }
    }

    /// Use a non-standard gateway port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.gateway.set_port(port);
        self
    }

    /// Override the connect timeout. A zero duration means no timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout.filter(|timeout| !timeout.is_zero());
        self
    }

    /// Override the read timeout. A zero duration means no timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout.filter(|timeout| !timeout.is_zero());
        self
    }

    /// Parse a `KEY=VALUE` block.
    ///
    /// Blank lines, `#` comments and unknown keys are skipped.
    ///
    /// ```
    /// use knx_tunnel::TunnelConfig;
    ///
    /// let config = TunnelConfig::parse_env_str("
    ///     # living room gateway
    ///     KNX_GATEWAY_IP=192.168.1.10
    ///     KNX_READ_TIMEOUT_MS=0
    /// ").unwrap();
    /// assert_eq!(config.gateway.to_string(), "192.168.1.10:3671");
    /// assert_eq!(config.read_timeout, None);
    /// ```
    pub fn parse_env_str(config: &str) -> Result<Self> {
        Self::from_lookup(|key| {
            config
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .filter_map(|line| line.split_once('='))
                .find(|(k, _)| k.trim() == key)
                .map(|(_, v)| v.trim().to_owned())
        })
    }

    /// Read the same keys from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let ip = lookup(KEY_GATEWAY_IP).ok_or_else(|| KnxError::config_missing(KEY_GATEWAY_IP))?;
        let ip: Ipv4Addr = ip.parse().map_err(|_| KnxError::config_invalid(KEY_GATEWAY_IP))?;

        let mut config = Self::new(ip);

        if let Some(port) = lookup(KEY_GATEWAY_PORT) {
            let port = port.parse().map_err(|_| KnxError::config_invalid(KEY_GATEWAY_PORT))?;
            config = config.with_port(port);
        }
        if let Some(ms) = lookup(KEY_CONNECT_TIMEOUT_MS) {
            config = config.with_connect_timeout(parse_timeout(KEY_CONNECT_TIMEOUT_MS, &ms)?);
        }
        if let Some(ms) = lookup(KEY_READ_TIMEOUT_MS) {
            config = config.with_read_timeout(parse_timeout(KEY_READ_TIMEOUT_MS, &ms)?);
        }

        Ok(config)
    }
}

fn parse_timeout(key: &'static str, value: &str) -> Result<Option<Duration>> {
    let ms: u64 = value.parse().map_err(|_| KnxError::config_invalid(key))?;
    Ok((ms > 0).then(|| Duration::from_millis(ms)))
}
