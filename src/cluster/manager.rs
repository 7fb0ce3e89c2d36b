//! Cluster Manager
//!
//! Coordinates full-mesh cluster membership and message forwarding between
//! VibeMQ nodes: active seed dialing, the HELLO handshake, duplicate-dial
//! resolution, peer liveness, and subscription/retained synchronization.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::protocol::QoS;
use crate::remote::RemotePeer;
use crate::remote::RemotePeerStatus;

use super::dedup::DedupCache;
use super::peer::{ClusterInboundCallback, ClusterPeer, RetainedProviderCallback};
use super::protocol::{frame_message, read_frame_length, ClusterMessage, CLUSTER_PROTOCOL_VERSION};

/// Notified whenever a peer is admitted into (`true`) or drops out of
/// (`false`) the mesh, so the broker can surface `PeerJoined`/`PeerLeft`.
pub type PeerEventCallback = Arc<dyn Fn(String, bool) + Send + Sync>;

/// Cluster manager for full-mesh horizontal scaling
pub struct ClusterManager {
    /// Our node ID
    node_id: String,
    /// Cluster configuration
    config: ClusterConfig,
    /// Connected peer nodes, keyed by remote node id
    peers: Arc<DashMap<String, Arc<ClusterPeer>>>,
    /// Local subscriptions (topic filters we have subscribers for)
    local_subscriptions: Arc<RwLock<HashSet<String>>>,
    /// Callback for application messages re-injected from cluster peers
    inbound_callback: ClusterInboundCallback,
    /// Snapshot provider for RETAINED_REQUEST responses
    retained_provider: RetainedProviderCallback,
    /// Forwarded-message dedup cache, shared by every peer connection
    dedup: Arc<DedupCache>,
    /// Fired on peer join/leave
    peer_events: RwLock<Option<PeerEventCallback>>,
}

impl ClusterManager {
    /// Create a new cluster manager. Does not bind or dial anything yet —
    /// call `start()` to begin accepting and dialing.
    pub async fn new(
        config: ClusterConfig,
        inbound_callback: ClusterInboundCallback,
        retained_provider: RetainedProviderCallback,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let node_id = config.get_node_id();
        let dedup = Arc::new(DedupCache::new(config.message_id_cache_expiry()));

        Ok(Self {
            node_id,
            config,
            peers: Arc::new(DashMap::new()),
            local_subscriptions: Arc::new(RwLock::new(HashSet::new())),
            inbound_callback,
            retained_provider,
            dedup,
            peer_events: RwLock::new(None),
        })
    }

    /// Register a callback fired with `(node_id, joined)` on membership change.
    pub fn set_peer_event_callback(&self, cb: PeerEventCallback) {
        *self.peer_events.write() = Some(cb);
    }

    fn fire_peer_event(&self, node_id: String, joined: bool) {
        if let Some(cb) = self.peer_events.read().as_ref() {
            cb(node_id, joined);
        }
    }

    /// Get our node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the number of known peers (connected or not)
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Get the number of connected peers
    pub fn connected_peer_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.value().status() == RemotePeerStatus::Connected)
            .count()
    }

    /// Replace the set of local subscription filters and broadcast a full
    /// sync to every alive peer.
    pub async fn update_subscriptions(&self, filters: HashSet<String>) {
        {
            let mut subs = self.local_subscriptions.write();
            *subs = filters.clone();
        }
        let filters: Vec<String> = filters.into_iter().collect();
        for peer in self.peers.iter() {
            if peer.value().status() == RemotePeerStatus::Connected {
                let _ = peer
                    .value()
                    .notify_subscribe_all(filters.clone())
                    .await;
            }
        }
    }

    /// Add a subscription filter and broadcast an incremental SUB to peers.
    pub async fn add_subscription(&self, filter: String) {
        {
            let mut subs = self.local_subscriptions.write();
            subs.insert(filter.clone());
        }
        for peer in self.peers.iter() {
            if peer.value().status() == RemotePeerStatus::Connected {
                let _ = peer.value().notify_subscribe(&filter, QoS::AtMostOnce).await;
            }
        }
    }

    /// Remove a subscription filter and broadcast an incremental UNSUB.
    pub async fn remove_subscription(&self, filter: &str) {
        {
            let mut subs = self.local_subscriptions.write();
            subs.remove(filter);
        }
        for peer in self.peers.iter() {
            if peer.value().status() == RemotePeerStatus::Connected {
                let _ = peer.value().notify_unsubscribe(filter).await;
            }
        }
    }

    /// Forward a locally-published message to every peer with a matching
    /// recorded subscription. Generates a fresh `message_uuid` per call.
    pub async fn forward_publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) {
        for peer in self.peers.iter() {
            let peer_ref = peer.value();
            if peer_ref.status() == RemotePeerStatus::Connected && peer_ref.should_forward(topic) {
                if let Err(e) = peer_ref
                    .forward_publish(topic, payload.clone(), qos, retain)
                    .await
                {
                    warn!(
                        "Failed to forward message to peer '{}': {}",
                        peer_ref.node_id(),
                        e
                    );
                }
            }
        }
    }

    /// Start the cluster manager: bind the peer listener, spawn the accept
    /// loop, dial every seed, and start the liveness sweep.
    pub async fn start(self: &Arc<Self>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            "Cluster '{}' starting: node={} bind={}",
            self.config.cluster_name, self.node_id, self.config.bind_addr
        );

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let this = self.clone();
        tokio::spawn(async move {
            this.accept_loop(listener).await;
        });

        for seed in self.config.seeds.clone() {
            let this = self.clone();
            tokio::spawn(async move {
                this.dial_seed(seed).await;
            });
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.liveness_sweep_loop().await;
        });

        Ok(())
    }

    /// Stop the cluster manager and every peer connection.
    pub async fn stop(&self) {
        info!("Stopping cluster manager '{}'", self.node_id);
        for peer in self.peers.iter() {
            let _ = peer.value().stop().await;
        }
        self.peers.clear();
    }

    async fn liveness_sweep_loop(self: Arc<Self>) {
        let node_timeout = self.config.node_timeout();
        let mut interval = tokio::time::interval(node_timeout / 2);
        loop {
            interval.tick().await;
            let now = Instant::now();
            let stale: Vec<String> = self
                .peers
                .iter()
                .filter(|e| now.duration_since(e.value().last_seen()) > node_timeout)
                .map(|e| e.key().clone())
                .collect();

            for node_id in stale {
                if let Some((_, peer)) = self.peers.remove(&node_id) {
                    warn!(
                        "cluster peer '{}' timed out (no frame in {:?})",
                        node_id, node_timeout
                    );
                    let _ = peer.stop().await;
                    self.fire_peer_event(node_id, false);
                }
            }
        }
    }

    async fn dial_seed(self: Arc<Self>, seed: String) {
        let mut backoff = Duration::from_millis(500);
        let max_backoff = Duration::from_secs(30);

        loop {
            let addr: SocketAddr = match seed.parse() {
                Ok(a) => a,
                Err(e) => {
                    error!("invalid cluster seed address '{}': {}", seed, e);
                    return;
                }
            };

            if self.peers.iter().any(|p| p.value().peer_addr() == addr) {
                tokio::time::sleep(self.config.heartbeat_interval() * 3).await;
                continue;
            }

            match self.connect_to_seed(addr).await {
                Ok(()) => {
                    backoff = Duration::from_millis(500);
                }
                Err(e) => {
                    debug!("cluster: dial to seed {} failed: {}", addr, e);
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, max_backoff);
                }
            }

            tokio::time::sleep(self.config.heartbeat_interval()).await;
        }
    }

    async fn connect_to_seed(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut stream = TcpStream::connect(addr).await?;

        let hello = ClusterMessage::Hello {
            node_id: self.node_id.clone(),
            version: CLUSTER_PROTOCOL_VERSION,
            cluster_name: self.config.cluster_name.clone(),
            listen_port: self.config.bind_addr.port(),
        };
        stream.write_all(&frame_message(&hello)?).await?;

        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut buf)).await??;
        if n == 0 {
            return Err("peer closed connection before HelloAck".into());
        }
        let len = read_frame_length(&buf[..n]).ok_or("invalid frame")? as usize;
        if n < 4 + len {
            return Err("incomplete HelloAck frame".into());
        }
        let msg = ClusterMessage::decode(&buf[4..4 + len])?;

        let (peer_node_id, peer_cluster_name) = match msg {
            ClusterMessage::HelloAck {
                node_id,
                version,
                cluster_name,
                ..
            } => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(format!(
                        "protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )
                    .into());
                }
                (node_id, cluster_name)
            }
            _ => return Err("expected HelloAck".into()),
        };

        if peer_cluster_name != self.config.cluster_name {
            return Err(format!(
                "cluster name mismatch: local='{}' remote='{}'",
                self.config.cluster_name, peer_cluster_name
            )
            .into());
        }

        if peer_node_id == self.node_id {
            return Err("peer reports the same node_id as this node".into());
        }

        self.admit_peer(peer_node_id, addr, stream).await;
        Ok(())
    }

    /// Accept inbound peer connections, performing the passive side of the
    /// HELLO handshake.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_incoming(stream, addr).await {
                            debug!("cluster: incoming connection from {} rejected: {}", addr, e);
                        }
                    });
                }
                Err(e) => error!("cluster: accept failed: {}", e),
            }
        }
    }

    async fn handle_incoming(
        self: Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut buf)).await??;
        if n == 0 {
            return Err("connection closed before Hello".into());
        }
        let len = read_frame_length(&buf[..n]).ok_or("invalid frame")? as usize;
        if n < 4 + len {
            return Err("incomplete Hello frame".into());
        }
        let msg = ClusterMessage::decode(&buf[4..4 + len])?;

        let (peer_node_id, peer_cluster_name, peer_listen_port) = match msg {
            ClusterMessage::Hello {
                node_id,
                version,
                cluster_name,
                listen_port,
            } => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(format!(
                        "protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )
                    .into());
                }
                (node_id, cluster_name, listen_port)
            }
            _ => return Err("expected Hello".into()),
        };

        if peer_cluster_name != self.config.cluster_name {
            warn!(
                "cluster: rejecting peer '{}' from {}: cluster_name mismatch ('{}' != '{}')",
                peer_node_id, addr, peer_cluster_name, self.config.cluster_name
            );
            return Err("cluster_name mismatch".into());
        }

        if peer_node_id == self.node_id {
            warn!(
                "cluster: rejecting peer from {} claiming our own node_id '{}'",
                addr, peer_node_id
            );
            return Err("duplicate node_id".into());
        }

        // Duplicate-dial resolution: if we already hold an outbound connection
        // to this node, the lower node_id keeps its outbound and the higher
        // one's inbound is dropped.
        if let Some(existing) = self.peers.get(&peer_node_id) {
            if existing.status() == RemotePeerStatus::Connected {
                if self.node_id < peer_node_id {
                    debug!(
                        "cluster: dropping inbound from '{}' ({}:{}), already connected outbound and our id sorts lower",
                        peer_node_id, addr.ip(), peer_listen_port
                    );
                    let ack = ClusterMessage::HelloAck {
                        node_id: self.node_id.clone(),
                        version: CLUSTER_PROTOCOL_VERSION,
                        cluster_name: self.config.cluster_name.clone(),
                        listen_port: self.config.bind_addr.port(),
                    };
                    let _ = stream.write_all(&frame_message(&ack)?).await;
                    return Ok(());
                }
            }
        }

        let ack = ClusterMessage::HelloAck {
            node_id: self.node_id.clone(),
            version: CLUSTER_PROTOCOL_VERSION,
            cluster_name: self.config.cluster_name.clone(),
            listen_port: self.config.bind_addr.port(),
        };
        stream.write_all(&frame_message(&ack)?).await?;

        let remote_addr = SocketAddr::new(addr.ip(), peer_listen_port);
        self.admit_peer(peer_node_id, remote_addr, stream).await;
        Ok(())
    }

    /// Common tail of both the active and passive handshake paths: spawn the
    /// steady-state connection, record it, request a retained sync, and
    /// replay our current subscription set.
    async fn admit_peer(self: &Arc<Self>, peer_node_id: String, peer_addr: SocketAddr, stream: TcpStream) {
        info!("cluster: peer '{}' admitted ({})", peer_node_id, peer_addr);

        let peer = ClusterPeer::spawn_from_stream(
            peer_node_id.clone(),
            peer_addr,
            self.node_id.clone(),
            stream,
            self.inbound_callback.clone(),
            self.retained_provider.clone(),
            self.dedup.clone(),
            self.config.heartbeat_interval(),
        );

        self.peers.insert(peer_node_id.clone(), peer.clone());
        self.fire_peer_event(peer_node_id, true);

        let filters: Vec<String> = self.local_subscriptions.read().iter().cloned().collect();
        if !filters.is_empty() {
            let _ = peer.notify_subscribe_all(filters).await;
        }
        if self.config.enable_deduplication {
            let _ = peer.request_retained_sync().await;
        }
    }
}
