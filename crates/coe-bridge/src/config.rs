//! Configuration types for the CoE bridge
//!
//! This module provides configuration structures for the bridge including
//! the listen address, the remote CMI peers and the resend/liveness timing.

use coe_protocol::{CoeVersion, COE_PORT};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use tracing::warn;

use crate::error::{CoeError, Result};

/// Default interval between full page resends
pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default interval between availability publications
pub const DEFAULT_AVAILABILITY_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default silence after which a peer is reported offline
pub const DEFAULT_OFFLINE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Default capacity of the publication queue
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 1024;

/// Main configuration for a CoE bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Address the receive socket binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Protocol version assumed for senders that are not configured peers
    #[serde(default)]
    pub default_version: CoeVersion,

    /// Interval between full resends of all written pages
    #[serde(with = "humantime_serde", default = "default_resend_interval")]
    pub resend_interval: Duration,

    /// Interval between availability publications
    #[serde(with = "humantime_serde", default = "default_availability_interval")]
    pub availability_interval: Duration,

    /// Silence after which a peer is considered offline
    #[serde(with = "humantime_serde", default = "default_offline_after")]
    pub offline_after: Duration,

    /// Capacity of the queue between the receive path and the publisher
    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,

    /// Remote CMI peers that receive outbound channel writes
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// A remote CMI device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Display name (used for logging)
    #[serde(default)]
    pub name: String,

    /// IP address of the device
    pub address: IpAddr,

    /// UDP port of the device
    #[serde(default = "default_peer_port")]
    pub port: u16,

    /// Analog field width used by this device
    #[serde(default)]
    pub version: CoeVersion,
}

impl PeerConfig {
    /// Create a peer on the default port with protocol version 1
    pub fn new(address: IpAddr) -> Self {
        Self {
            name: address.to_string(),
            address,
            port: COE_PORT,
            version: CoeVersion::V1,
        }
    }

    /// Socket address datagrams are sent to
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), COE_PORT)
}

fn default_resend_interval() -> Duration {
    DEFAULT_RESEND_INTERVAL
}

fn default_availability_interval() -> Duration {
    DEFAULT_AVAILABILITY_INTERVAL
}

fn default_offline_after() -> Duration {
    DEFAULT_OFFLINE_AFTER
}

fn default_event_queue_size() -> usize {
    DEFAULT_EVENT_QUEUE_SIZE
}

fn default_peer_port() -> u16 {
    COE_PORT
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            default_version: CoeVersion::V1,
            resend_interval: DEFAULT_RESEND_INTERVAL,
            availability_interval: DEFAULT_AVAILABILITY_INTERVAL,
            offline_after: DEFAULT_OFFLINE_AFTER,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            peers: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CoeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Check the configuration for values the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.resend_interval.is_zero() {
            return Err(CoeError::InvalidConfig(
                "resend_interval must be greater than zero".to_string(),
            ));
        }
        if self.availability_interval.is_zero() {
            return Err(CoeError::InvalidConfig(
                "availability_interval must be greater than zero".to_string(),
            ));
        }
        if self.event_queue_size == 0 {
            return Err(CoeError::InvalidConfig(
                "event_queue_size must be greater than zero".to_string(),
            ));
        }

        if self.offline_after < self.availability_interval {
            warn!(
                "offline_after ({}) is shorter than availability_interval ({}); peers may flap offline between checks",
                humantime::format_duration(self.offline_after),
                humantime::format_duration(self.availability_interval)
            );
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.address) {
                return Err(CoeError::InvalidConfig(format!(
                    "peer {} configured more than once",
                    peer.address
                )));
            }
        }
        Ok(())
    }

    /// Look up a configured peer by address
    pub fn peer(&self, address: IpAddr) -> Option<&PeerConfig> {
        self.peers.iter().find(|peer| peer.address == address)
    }

    /// Protocol version used to decode datagrams from `address`
    pub fn version_for(&self, address: IpAddr) -> CoeVersion {
        self.peer(address)
            .map(|peer| peer.version)
            .unwrap_or(self.default_version)
    }

    /// Receive buffer size large enough for every configured version
    pub fn receive_buffer_len(&self) -> usize {
        self.peers
            .iter()
            .map(|peer| peer.version.receive_buffer_len())
            .chain(std::iter::once(self.default_version.receive_buffer_len()))
            .max()
            .unwrap_or(coe_protocol::MIN_FRAME_LEN)
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the receive socket address
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    /// Set the version assumed for unknown senders
    pub fn default_version(mut self, version: CoeVersion) -> Self {
        self.config.default_version = version;
        self
    }

    /// Set the resend interval
    pub fn resend_interval(mut self, interval: Duration) -> Self {
        self.config.resend_interval = interval;
        self
    }

    /// Set the availability publication interval
    pub fn availability_interval(mut self, interval: Duration) -> Self {
        self.config.availability_interval = interval;
        self
    }

    /// Set the offline threshold
    pub fn offline_after(mut self, threshold: Duration) -> Self {
        self.config.offline_after = threshold;
        self
    }

    /// Add a peer
    pub fn peer(mut self, peer: PeerConfig) -> Self {
        self.config.peers.push(peer);
        self
    }

    /// Build the configuration
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
