use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use crate::bandwidth::allocator::DEFAULT_PERIOD_MS;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// TCP port peers connect to; also the port kept mapped on the gateway.
    pub peer_port: u16,
    /// Non-default bind address for outgoing HTTP transfers. IPv4 wins
    /// when both are set.
    pub bind_v4: Option<Ipv4Addr>,
    pub bind_v6: Option<Ipv6Addr>,
    /// Directory holding `cookies.txt` and other read-only session inputs.
    pub config_dir: PathBuf,
    /// Allocator tick length in milliseconds.
    pub period_ms: u64,
    pub download_limit_bps: u64,
    pub download_limited: bool,
    pub upload_limit_bps: u64,
    pub upload_limited: bool,
    /// Keep the peer port mapped on the gateway.
    pub port_forwarding: bool,
}

impl SessionConfig {
    pub fn new(peer_port: u16) -> Self {
        Self {
            peer_port,
            bind_v4: None,
            bind_v6: None,
            config_dir: PathBuf::from("."),
            period_ms: DEFAULT_PERIOD_MS,
            download_limit_bps: 0,
            download_limited: false,
            upload_limit_bps: 0,
            upload_limited: false,
            port_forwarding: false,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(6_881)
    }
}
