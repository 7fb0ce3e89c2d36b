//! MQTT-SN gateway
//!
//! Translates MQTT-SN datagrams into broker publish/subscribe operations.
//! Each `(remote-addr, remote-port)` virtual connection from
//! `transport::UdpDemux` gets its own `SnClient`: a numeric topic-id
//! registry (assigned on REGISTER, looked up on PUBLISH/SUBSCRIBE) and a
//! set of subscribed filters matched against the broker's publish event
//! stream, symmetric to the CoAP gateway's per-topic observer list.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerEvent};
use crate::codec::sn::{SnFlags, SnMessage, SnTopic, TopicIdType};
use crate::protocol::QoS;
use crate::topic::validation::topic_matches_filter;
use crate::transport::UdpDemux;

/// MQTT-SN clients are typically sleepy battery-powered devices; give them a
/// longer idle allowance than the CoAP gateway's default before the
/// underlying UDP virtual connection is reclaimed.
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct SnGatewayConfig {
    pub bind_addr: SocketAddr,
    pub session_timeout: Duration,
}

impl SnGatewayConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self { bind_addr, session_timeout: DEFAULT_SESSION_TIMEOUT }
    }
}

struct SnClient {
    client_id: RwLock<String>,
    topic_ids: DashMap<String, u16>,
    topic_names: DashMap<u16, String>,
    next_topic_id: AtomicU16,
    filters: RwLock<HashSet<String>>,
}

impl SnClient {
    fn new() -> Self {
        Self {
            client_id: RwLock::new(String::new()),
            topic_ids: DashMap::new(),
            topic_names: DashMap::new(),
            next_topic_id: AtomicU16::new(1),
            filters: RwLock::new(HashSet::new()),
        }
    }

    fn register(&self, name: &str) -> u16 {
        if let Some(existing) = self.topic_ids.get(name) {
            return *existing;
        }
        let id = self.next_topic_id.fetch_add(1, Ordering::Relaxed);
        self.topic_ids.insert(name.to_string(), id);
        self.topic_names.insert(id, name.to_string());
        id
    }

    fn name_for(&self, id: u16) -> Option<String> {
        self.topic_names.get(&id).map(|e| e.clone())
    }
}

pub struct SnGateway {
    broker: Arc<Broker>,
    config: SnGatewayConfig,
    clients: DashMap<SocketAddr, Arc<SnClient>>,
}

impl SnGateway {
    pub fn new(broker: Arc<Broker>, config: SnGatewayConfig) -> Arc<Self> {
        Arc::new(Self { broker, config, clients: DashMap::new() })
    }

    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let (demux, mut accept_rx) = UdpDemux::bind(self.config.bind_addr, self.config.session_timeout).await?;
        info!("MQTT-SN gateway listening on {}", self.config.bind_addr);

        let forwarder = self.clone();
        let forward_demux = demux.clone();
        tokio::spawn(async move {
            forwarder.forward_publishes(forward_demux).await;
        });

        while let Some(mut conn) = accept_rx.recv().await {
            let gateway = self.clone();
            let demux = demux.clone();
            tokio::spawn(async move {
                let remote = conn.remote;
                let client = gateway.clients.entry(remote).or_insert_with(|| Arc::new(SnClient::new())).clone();
                while let Some(datagram) = conn.recv().await {
                    let request = match SnMessage::decode(&datagram) {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!("malformed MQTT-SN datagram from {}: {}", remote, e);
                            continue;
                        }
                    };
                    if let Some(response) = gateway.handle_message(remote, &client, request) {
                        if let Err(e) = demux.send_to(remote, &response.encode()).await {
                            warn!("failed to send MQTT-SN response to {}: {}", remote, e);
                        }
                    }
                }
                gateway.clients.remove(&remote);
            });
        }
        Ok(())
    }

    fn handle_message(&self, remote: SocketAddr, client: &Arc<SnClient>, msg: SnMessage) -> Option<SnMessage> {
        match msg {
            SnMessage::Connect { client_id, .. } => {
                *client.client_id.write() = client_id;
                Some(SnMessage::ConnAck { return_code: 0 })
            }
            SnMessage::Register { msg_id, topic_name, .. } => {
                let topic_id = client.register(&topic_name);
                Some(SnMessage::RegAck { topic_id, msg_id, return_code: 0 })
            }
            SnMessage::Publish { flags, topic_id, msg_id, data } => {
                let topic = match flags.topic_id_type {
                    TopicIdType::Normal => client.name_for(topic_id),
                    _ => None,
                };
                match topic {
                    Some(topic) => {
                        self.broker.publish(topic, data, flags.qos, flags.retain);
                        if flags.qos == QoS::AtMostOnce {
                            None
                        } else {
                            Some(SnMessage::PubAck { topic_id, msg_id, return_code: 0 })
                        }
                    }
                    None => Some(SnMessage::PubAck { topic_id, msg_id, return_code: 0x02 }), // Rejected: invalid topic ID
                }
            }
            SnMessage::Subscribe { flags, msg_id, topic } => {
                let (topic_id, filter) = match topic {
                    SnTopic::Name(name) => {
                        let id = client.register(&name);
                        (id, name)
                    }
                    SnTopic::Id(id) => match client.name_for(id) {
                        Some(name) => (id, name),
                        None => {
                            return Some(SnMessage::SubAck {
                                flags: SnFlags::default(),
                                topic_id: id,
                                msg_id,
                                return_code: 0x02,
                            })
                        }
                    },
                };
                client.filters.write().insert(filter);
                debug!("MQTT-SN client {} subscribed via topic id {}", remote, topic_id);
                Some(SnMessage::SubAck { flags, topic_id, msg_id, return_code: 0 })
            }
            SnMessage::Unsubscribe { msg_id, topic } => {
                let filter = match topic {
                    SnTopic::Name(name) => Some(name),
                    SnTopic::Id(id) => client.name_for(id),
                };
                if let Some(filter) = filter {
                    client.filters.write().remove(&filter);
                }
                Some(SnMessage::UnsubAck { msg_id })
            }
            SnMessage::PingReq { .. } => Some(SnMessage::PingResp),
            SnMessage::Disconnect { .. } => {
                self.clients.remove(&remote);
                None
            }
            _ => None,
        }
    }

    /// Fan every broker publish out to clients with a matching subscribed
    /// filter, translating the topic into that client's own topic-id space
    /// (auto-registering it if this is the first message on that topic).
    async fn forward_publishes(self: Arc<Self>, demux: Arc<UdpDemux>) {
        let mut events = self.broker.subscribe_events();
        loop {
            match events.recv().await {
                Ok(BrokerEvent::MessagePublished { topic, payload, qos, retain }) => {
                    let targets: Vec<(SocketAddr, Arc<SnClient>)> = self
                        .clients
                        .iter()
                        .filter(|e| e.value().filters.read().iter().any(|f| topic_matches_filter(&topic, f)))
                        .map(|e| (*e.key(), e.value().clone()))
                        .collect();

                    for (remote, client) in targets {
                        let topic_id = client.register(&topic);
                        let publish = SnMessage::Publish {
                            flags: SnFlags { qos, retain, ..SnFlags::default() },
                            topic_id,
                            msg_id: 0,
                            data: payload.clone(),
                        };
                        if let Err(e) = demux.send_to(remote, &publish.encode()).await {
                            debug!("failed to forward publish to MQTT-SN client {}: {}", remote, e);
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
