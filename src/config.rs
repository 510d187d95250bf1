//! Runtime configuration.
//!
//! A single `Config` is built at startup and handed to the poller, hub and
//! server constructors. Nothing reads configuration from global state.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::snapshot::decode::MIN_REGION_SIZE;

/// Location of the region written by the database. Fixed for this deployment.
pub const DEFAULT_REGION_PATH: &str = "/tmp/syndrdb_metrics.mmap";

/// Bytes copied per acquisition (one page).
pub const DEFAULT_REGION_MAP_LEN: usize = 4096;

pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Port of the HTTP/WebSocket listener. `0` picks an ephemeral port.
    pub http_port: u16,
    pub bind_addr: IpAddr,
    /// Period between poll cycles.
    pub poll_interval: Duration,
    pub region_path: PathBuf,
    /// Upper bound on the number of bytes read from the region file.
    pub region_map_len: usize,
    /// Bound on a single write to one subscriber.
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    /// How long shutdown waits for subscribers to unregister.
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            poll_interval: DEFAULT_POLL_INTERVAL,
            region_path: PathBuf::from(DEFAULT_REGION_PATH),
            region_map_len: DEFAULT_REGION_MAP_LEN,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.http_port)
    }

    /// Checks the invariants the rest of the pipeline relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("poll_interval"));
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::ZeroInterval("write_timeout"));
        }
        if self.ping_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("ping_interval"));
        }
        if self.region_map_len < MIN_REGION_SIZE {
            return Err(ConfigError::MapTooSmall {
                len: self.region_map_len,
                min: MIN_REGION_SIZE,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A duration that must be positive is zero.
    ZeroInterval(&'static str),
    /// The read length cannot hold the base section.
    MapTooSmall { len: usize, min: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroInterval(name) => write!(f, "{} must be greater than zero", name),
            ConfigError::MapTooSmall { len, min } => write!(
                f,
                "region read length {} is below the minimum region size {}",
                len, min
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
