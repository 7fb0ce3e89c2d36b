//! Cluster Peer
//!
//! Drives a single established connection to another node in the mesh:
//! handshake already completed by the manager, this type owns the steady
//! state message loop (heartbeats, forwarded publishes, subscription sync,
//! retained sync) and implements `RemotePeer` for unified forwarding.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::protocol::QoS;
use crate::remote::{RemoteError, RemotePeer, RemotePeerStatus};
use crate::topic::topic_matches_filter;

use super::dedup::DedupCache;
use super::protocol::{frame_message, read_frame_length, ClusterMessage};

/// Commands sent to the peer connection task
#[derive(Debug)]
pub enum ClusterCommand {
    /// Forward a publish message
    ForwardedPublish {
        origin_node_id: String,
        message_uuid: [u8; 16],
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// Send subscription sync
    SyncSubscriptions { filters: Vec<String> },
    /// Send subscription update
    UpdateSubscriptions {
        added: Vec<String>,
        removed: Vec<String>,
    },
    /// Ask the peer for its full retained-message set
    RequestRetained,
    /// Reply to a RequestRetained with a single entry
    RetainedEntry {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// Terminate a RequestRetained reply stream
    RetainedEnd,
    /// Shutdown the connection
    Shutdown,
}

/// Callback for application messages received from a cluster peer:
/// `(topic, payload, qos, retain, origin_node_id)`.
pub type ClusterInboundCallback = Arc<dyn Fn(String, Bytes, QoS, bool, String) + Send + Sync>;

/// Callback invoked when a peer asks for our retained-message set. Returns
/// a snapshot of `(topic, payload, qos, retain)` tuples to send back.
pub type RetainedProviderCallback = Arc<dyn Fn() -> Vec<(String, Bytes, QoS, bool)> + Send + Sync>;

/// A connection to another cluster node, already past the HELLO handshake.
pub struct ClusterPeer {
    node_id: String,
    peer_addr: SocketAddr,
    status: Arc<RwLock<RemotePeerStatus>>,
    command_tx: Option<mpsc::Sender<ClusterCommand>>,
    /// Remote node's subscriptions, maintained via SubscriptionSync/Update
    remote_subscriptions: Arc<RwLock<HashSet<String>>>,
    local_node_id: String,
    /// Last time any frame (including Heartbeat) was received from this peer.
    /// Used by the manager's liveness sweep against `node_timeout_ms`.
    last_seen: Arc<RwLock<Instant>>,
}

impl ClusterPeer {
    /// Drive the steady-state message loop over an already-connected,
    /// already-handshaken stream. `stream` must have consumed exactly the
    /// HELLO/HELLOACK frames and nothing more.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_from_stream(
        node_id: String,
        peer_addr: SocketAddr,
        local_node_id: String,
        stream: TcpStream,
        inbound_callback: ClusterInboundCallback,
        retained_provider: RetainedProviderCallback,
        dedup: Arc<DedupCache>,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        let status = Arc::new(RwLock::new(RemotePeerStatus::Connected));
        let remote_subscriptions = Arc::new(RwLock::new(HashSet::new()));
        let last_seen = Arc::new(RwLock::new(Instant::now()));
        let (tx, rx) = mpsc::channel(4096);

        let peer = Arc::new(Self {
            node_id: node_id.clone(),
            peer_addr,
            status: status.clone(),
            command_tx: Some(tx),
            remote_subscriptions: remote_subscriptions.clone(),
            local_node_id: local_node_id.clone(),
            last_seen: last_seen.clone(),
        });

        tokio::spawn(Self::connection_loop(
            node_id,
            stream,
            status,
            rx,
            inbound_callback,
            retained_provider,
            remote_subscriptions,
            dedup,
            heartbeat_interval,
            last_seen,
        ));

        peer
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Time of the last frame (including a bare Heartbeat) received from this
    /// peer. A manager-level sweep compares this against `node_timeout_ms`.
    pub fn last_seen(&self) -> Instant {
        *self.last_seen.read()
    }

    pub async fn request_retained_sync(&self) -> Result<(), RemoteError> {
        if let Some(ref tx) = self.command_tx {
            tx.send(ClusterCommand::RequestRetained)
                .await
                .map_err(|_| RemoteError::ConnectionLost("command channel closed".to_string()))?;
        }
        Ok(())
    }

    /// Send a full subscription-set replacement (used right after admission
    /// and whenever the local subscription set is bulk-replaced).
    pub async fn notify_subscribe_all(&self, filters: Vec<String>) -> Result<(), RemoteError> {
        if let Some(ref tx) = self.command_tx {
            tx.send(ClusterCommand::SyncSubscriptions { filters })
                .await
                .map_err(|_| RemoteError::ConnectionLost("command channel closed".to_string()))?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn connection_loop(
        node_id: String,
        stream: TcpStream,
        status: Arc<RwLock<RemotePeerStatus>>,
        mut command_rx: mpsc::Receiver<ClusterCommand>,
        inbound_callback: ClusterInboundCallback,
        retained_provider: RetainedProviderCallback,
        remote_subs: Arc<RwLock<HashSet<String>>>,
        dedup: Arc<DedupCache>,
        heartbeat_interval: Duration,
        last_seen: Arc<RwLock<Instant>>,
    ) {
        let (mut read_half, mut write_half) = stream.into_split();
        let mut read_buf = vec![0u8; 65536];
        let mut buf_offset = 0usize;

        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        heartbeat_timer.reset();

        let result: Result<(), RemoteError> = 'outer: loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    let Some(cmd) = cmd else { break 'outer Ok(()) };
                    if let Err(e) = Self::handle_outbound(&mut write_half, cmd).await {
                        break 'outer Err(e);
                    }
                }

                result = read_half.read(&mut read_buf[buf_offset..]) => {
                    match result {
                        Ok(0) => break 'outer Err(RemoteError::ConnectionLost("connection closed".to_string())),
                        Ok(n) => {
                            buf_offset += n;
                            if read_buf.len() - buf_offset < 4096 {
                                read_buf.resize(read_buf.len() * 2, 0);
                            }
                        }
                        Err(e) => break 'outer Err(RemoteError::ConnectionLost(e.to_string())),
                    }
                    *last_seen.write() = Instant::now();

                    loop {
                        let Some(len) = read_frame_length(&read_buf[..buf_offset]) else { break };
                        let len = len as usize;
                        if buf_offset < 4 + len {
                            break;
                        }

                        if let Ok(msg) = ClusterMessage::decode(&read_buf[4..4 + len]) {
                            if let Err(e) = Self::handle_inbound(
                                &node_id,
                                msg,
                                &mut write_half,
                                &inbound_callback,
                                &retained_provider,
                                &remote_subs,
                                &dedup,
                            ).await {
                                break 'outer Err(e);
                            }
                        }

                        read_buf.copy_within(4 + len..buf_offset, 0);
                        buf_offset -= 4 + len;
                    }
                }

                _ = heartbeat_timer.tick() => {
                    if let Ok(frame) = frame_message(&ClusterMessage::Heartbeat) {
                        if let Err(e) = write_half.write_all(&frame).await {
                            break 'outer Err(RemoteError::ConnectionLost(e.to_string()));
                        }
                    }
                }
            }
        };

        *status.write() = RemotePeerStatus::Disconnected;
        match result {
            Ok(()) => info!("cluster peer '{}' disconnected cleanly", node_id),
            Err(e) => error!("cluster peer '{}' connection lost: {}", node_id, e),
        }
    }

    async fn handle_outbound(
        write_half: &mut tokio::net::tcp::OwnedWriteHalf,
        cmd: ClusterCommand,
    ) -> Result<(), RemoteError> {
        let msg = match cmd {
            ClusterCommand::ForwardedPublish {
                origin_node_id,
                message_uuid,
                topic,
                payload,
                qos,
                retain,
            } => ClusterMessage::ForwardedPublish {
                origin_node_id,
                message_uuid,
                topic,
                payload: payload.to_vec(),
                qos: qos as u8,
                retain,
            },
            ClusterCommand::SyncSubscriptions { filters } => {
                ClusterMessage::SubscriptionSync { filters }
            }
            ClusterCommand::UpdateSubscriptions { added, removed } => {
                ClusterMessage::SubscriptionUpdate { added, removed }
            }
            ClusterCommand::RequestRetained => ClusterMessage::RetainedRequest,
            ClusterCommand::RetainedEntry {
                topic,
                payload,
                qos,
                retain,
            } => ClusterMessage::RetainedEntry {
                topic,
                payload: payload.to_vec(),
                qos: qos as u8,
                retain,
            },
            ClusterCommand::RetainedEnd => ClusterMessage::RetainedEnd,
            ClusterCommand::Shutdown => ClusterMessage::Goodbye,
        };

        let frame =
            frame_message(&msg).map_err(|e| RemoteError::Other(format!("encode error: {}", e)))?;
        write_half
            .write_all(&frame)
            .await
            .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;

        if matches!(msg, ClusterMessage::Goodbye) {
            return Err(RemoteError::ConnectionLost("local shutdown".to_string()));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_inbound(
        node_id: &str,
        msg: ClusterMessage,
        write_half: &mut tokio::net::tcp::OwnedWriteHalf,
        inbound_callback: &ClusterInboundCallback,
        retained_provider: &RetainedProviderCallback,
        remote_subs: &Arc<RwLock<HashSet<String>>>,
        dedup: &Arc<DedupCache>,
    ) -> Result<(), RemoteError> {
        match msg {
            ClusterMessage::ForwardedPublish {
                origin_node_id,
                message_uuid,
                topic,
                payload,
                qos,
                retain,
            } => {
                if dedup.check_and_insert(message_uuid) {
                    debug!("cluster peer '{}': dropping duplicate forwarded publish", node_id);
                    return Ok(());
                }
                let qos = QoS::from_u8(qos).unwrap_or(QoS::AtMostOnce);
                inbound_callback(topic, Bytes::from(payload), qos, retain, origin_node_id);
            }
            ClusterMessage::SubscriptionSync { filters } => {
                let mut subs = remote_subs.write();
                subs.clear();
                subs.extend(filters);
            }
            ClusterMessage::SubscriptionUpdate { added, removed } => {
                let mut subs = remote_subs.write();
                for f in removed {
                    subs.remove(&f);
                }
                for f in added {
                    subs.insert(f);
                }
            }
            ClusterMessage::RetainedRequest => {
                for (topic, payload, qos, retain) in retained_provider() {
                    let msg = ClusterMessage::RetainedEntry {
                        topic,
                        payload: payload.to_vec(),
                        qos: qos as u8,
                        retain,
                    };
                    if let Ok(frame) = frame_message(&msg) {
                        let _ = write_half.write_all(&frame).await;
                    }
                }
                if let Ok(frame) = frame_message(&ClusterMessage::RetainedEnd) {
                    let _ = write_half.write_all(&frame).await;
                }
            }
            ClusterMessage::RetainedEntry {
                topic,
                payload,
                qos,
                retain,
            } => {
                let qos = QoS::from_u8(qos).unwrap_or(QoS::AtMostOnce);
                inbound_callback(topic, Bytes::from(payload), qos, retain, String::new());
            }
            ClusterMessage::RetainedEnd => {
                debug!("cluster peer '{}': retained sync complete", node_id);
            }
            ClusterMessage::Heartbeat => {}
            ClusterMessage::Goodbye => {
                info!("cluster peer '{}': received goodbye", node_id);
                return Err(RemoteError::ConnectionLost("peer disconnected".to_string()));
            }
            ClusterMessage::Hello { .. } | ClusterMessage::HelloAck { .. } => {
                debug!("cluster peer '{}': unexpected handshake frame in steady state", node_id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemotePeer for ClusterPeer {
    fn name(&self) -> &str {
        &self.node_id
    }

    fn status(&self) -> RemotePeerStatus {
        *self.status.read()
    }

    async fn forward_publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RemoteError> {
        if let Some(ref tx) = self.command_tx {
            let mut message_uuid = [0u8; 16];
            rand::Rng::fill(&mut rand::thread_rng(), &mut message_uuid);
            tx.send(ClusterCommand::ForwardedPublish {
                origin_node_id: self.local_node_id.clone(),
                message_uuid,
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            })
            .await
            .map_err(|_| RemoteError::ConnectionLost("command channel closed".to_string()))?;
        }
        Ok(())
    }

    async fn notify_subscribe(&self, filter: &str, _qos: QoS) -> Result<(), RemoteError> {
        if let Some(ref tx) = self.command_tx {
            tx.send(ClusterCommand::UpdateSubscriptions {
                added: vec![filter.to_string()],
                removed: vec![],
            })
            .await
            .map_err(|_| RemoteError::ConnectionLost("command channel closed".to_string()))?;
        }
        Ok(())
    }

    async fn notify_unsubscribe(&self, filter: &str) -> Result<(), RemoteError> {
        if let Some(ref tx) = self.command_tx {
            tx.send(ClusterCommand::UpdateSubscriptions {
                added: vec![],
                removed: vec![filter.to_string()],
            })
            .await
            .map_err(|_| RemoteError::ConnectionLost("command channel closed".to_string()))?;
        }
        Ok(())
    }

    fn should_forward(&self, topic: &str) -> bool {
        let subs = self.remote_subscriptions.read();
        subs.iter().any(|filter| topic_matches_filter(topic, filter))
    }

    async fn start(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), RemoteError> {
        if let Some(ref tx) = self.command_tx {
            let _ = tx.send(ClusterCommand::Shutdown).await;
        }
        Ok(())
    }
}
