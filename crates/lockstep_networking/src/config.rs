//! # Configuration
//!
//! Settings shared by the arbiter and its clients, loaded once at startup.
//!
//! ```toml
//! server_host = "127.0.0.1"
//! server_port = 7777
//! tick_period_ns = 100000000
//! ```
//!
//! Every key is optional; missing keys take the defaults below.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use lockstep_core::{Packet, DEFAULT_JITTER_ALPHA, DEFAULT_MAX_PACKET_SIZE, DEFAULT_TICK_PERIOD_NS};
use serde::Deserialize;

use crate::error::ConfigError;

/// Default arbiter port.
pub const DEFAULT_PORT: u16 = 7777;

/// Lockstep configuration.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockstepConfig {
    /// Host the client connects to.
    pub server_host: String,
    /// Arbiter port.
    pub server_port: u16,
    /// Maximum number of concurrently connected clients.
    pub max_clients: usize,
    /// Tick period in nanoseconds.
    pub tick_period_ns: u64,
    /// Jitter smoothing factor, in (0, 1).
    pub jitter_alpha: f64,
    /// Maximum encoded packet size in bytes.
    pub max_packet_size: usize,
    /// Transport poll timeout in milliseconds.
    pub recv_timeout_ms: u64,
    /// Partial-ack cycles tolerated before the current tick is resent.
    pub max_tick_timeouts: u32,
    /// Delay between client reconnection attempts in milliseconds.
    pub reconnect_interval_ms: u64,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_owned(),
            server_port: DEFAULT_PORT,
            max_clients: 32,
            tick_period_ns: DEFAULT_TICK_PERIOD_NS,
            jitter_alpha: DEFAULT_JITTER_ALPHA,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            recv_timeout_ms: 1000,
            max_tick_timeouts: 20,
            reconnect_interval_ms: 1000,
        }
    }
}

impl LockstepConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks every value is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.jitter_alpha > 0.0 && self.jitter_alpha < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "jitter_alpha must be in (0, 1), got {}",
                self.jitter_alpha
            )));
        }
        if self.tick_period_ns == 0 {
            return Err(ConfigError::Invalid("tick_period_ns must be non-zero".into()));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be at least 1".into()));
        }
        if self.max_packet_size < Packet::MIN_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_packet_size must be at least {} bytes, got {}",
                Packet::MIN_SIZE,
                self.max_packet_size
            )));
        }
        if u32::try_from(self.max_packet_size).is_err() {
            return Err(ConfigError::Invalid(format!(
                "max_packet_size {} does not fit a frame length",
                self.max_packet_size
            )));
        }
        if self.recv_timeout_ms == 0 {
            return Err(ConfigError::Invalid("recv_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }

    /// Tick period.
    #[must_use]
    pub const fn tick_period(&self) -> Duration {
        Duration::from_nanos(self.tick_period_ns)
    }

    /// Transport poll timeout.
    #[must_use]
    pub const fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    /// Delay between reconnection attempts.
    #[must_use]
    pub const fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Address the arbiter listens on (all interfaces).
    #[must_use]
    pub const fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.server_port)
    }

    /// Resolves the arbiter address clients connect to.
    pub fn server_addr(&self) -> Result<SocketAddr, ConfigError> {
        (self.server_host.as_str(), self.server_port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::Invalid(format!("cannot resolve {}: {e}", self.server_host)))?
            .next()
            .ok_or_else(|| ConfigError::Invalid(format!("no address for {}", self.server_host)))
    }
}
