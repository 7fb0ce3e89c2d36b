//! Cluster Module
//!
//! Full-mesh horizontal clustering for VibeMQ. Every node dials every
//! configured seed and accepts inbound dials on its own cluster listener;
//! there is no gossip layer and no partial membership view — each node
//! tracks the complete set of peers it has a live or backing-off connection
//! to.
//!
//! # Usage
//!
//! ```toml
//! # vibemq.toml
//! [[cluster]]
//! enabled = true
//! cluster_name = "prod"
//! bind_addr = "0.0.0.0:7947"
//! seeds = ["node1:7947", "node2:7947"]
//! ```

mod dedup;
mod manager;
mod peer;
mod protocol;

pub use dedup::DedupCache;
pub use manager::{ClusterManager, PeerEventCallback};
pub use peer::{ClusterInboundCallback, ClusterPeer, RetainedProviderCallback};
pub use protocol::{ClusterMessage, CLUSTER_PROTOCOL_VERSION};

// Re-export cluster config
pub use crate::config::ClusterConfig;
