//! Cluster Configuration
//!
//! Configuration types for full-mesh peer clustering.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

/// Cluster configuration for full-mesh horizontal scaling
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Whether clustering is enabled
    pub enabled: bool,

    /// Node identifier (auto-generated if not set)
    pub node_id: Option<String>,

    /// Cluster name. Peers with a mismatched name are rejected during the
    /// HELLO handshake.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Address the cluster listener binds to.
    /// Default: 0.0.0.0:7947
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Address advertised to peers in the HELLO handshake (what they should
    /// dial to reach us). Falls back to `bind_addr` if unset.
    pub advertise_addr: Option<SocketAddr>,

    /// Seed nodes dialed on startup and whenever not already connected.
    /// Format: "host:port"
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// A peer unseen for longer than this is declared left
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,

    /// Whether forwarded-publish deduplication is enabled
    #[serde(default = "default_enable_deduplication")]
    pub enable_deduplication: bool,

    /// Expiry, in seconds, for entries in the forwarded-message dedup cache
    #[serde(default = "default_message_id_cache_expiry_s")]
    pub message_id_cache_expiry_s: u64,
}

fn default_cluster_name() -> String {
    "vibemq".to_string()
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:7947".parse().unwrap()
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_node_timeout_ms() -> u64 {
    15_000
}

fn default_enable_deduplication() -> bool {
    true
}

fn default_message_id_cache_expiry_s() -> u64 {
    60
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            cluster_name: default_cluster_name(),
            bind_addr: default_bind_addr(),
            advertise_addr: None,
            seeds: Vec::new(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            node_timeout_ms: default_node_timeout_ms(),
            enable_deduplication: default_enable_deduplication(),
            message_id_cache_expiry_s: default_message_id_cache_expiry_s(),
        }
    }
}

impl ClusterConfig {
    /// Get the node ID, generating a random one if not set
    pub fn get_node_id(&self) -> String {
        self.node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", rand_id()))
    }

    /// Get the address advertised to peers
    pub fn get_advertise_addr(&self) -> SocketAddr {
        self.advertise_addr.unwrap_or(self.bind_addr)
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Get node timeout as Duration
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    /// Get the dedup cache entry expiry as Duration
    pub fn message_id_cache_expiry(&self) -> Duration {
        Duration::from_secs(self.message_id_cache_expiry_s)
    }
}

/// Generate a random ID for node identification
fn rand_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}", nanos & 0xFFFF_FFFF)
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert!(!config.enabled);
        assert!(config.node_id.is_none());
        assert_eq!(config.cluster_name, "vibemq");
        assert_eq!(config.bind_addr, "0.0.0.0:7947".parse().unwrap());
        assert!(config.seeds.is_empty());
    }

    #[test]
    fn test_get_node_id_with_explicit() {
        let mut config = ClusterConfig::default();
        config.node_id = Some("my-node".to_string());
        assert_eq!(config.get_node_id(), "my-node");
    }

    #[test]
    fn test_get_node_id_auto_generated() {
        let config = ClusterConfig::default();
        let id = config.get_node_id();
        assert!(!id.is_empty());
    }

    #[test]
    fn test_advertise_addr_falls_back_to_bind() {
        let config = ClusterConfig::default();
        assert_eq!(config.get_advertise_addr(), config.bind_addr);
    }

    #[test]
    fn test_duration_conversions() {
        let mut config = ClusterConfig::default();
        config.heartbeat_interval_ms = 2_000;
        config.node_timeout_ms = 10_000;
        config.message_id_cache_expiry_s = 60;

        assert_eq!(config.heartbeat_interval(), Duration::from_millis(2_000));
        assert_eq!(config.node_timeout(), Duration::from_millis(10_000));
        assert_eq!(config.message_id_cache_expiry(), Duration::from_secs(60));
    }
}
