//! CoAP gateway
//!
//! Maps CoAP requests on `/<prefix>/<topic>` onto broker operations: `GET`
//! reads the retained payload, `GET` with `Observe=0` additionally registers
//! a long-lived observer that receives a `NON` notification for every
//! subsequent publish to that topic, `PUT`/`POST` publish with `retain=true`,
//! `DELETE` publishes an empty retained payload to clear it. One UDP socket
//! is demultiplexed into a virtual connection per client via
//! `transport::UdpDemux`; requests within a connection are handled
//! sequentially, notifications are pushed out independently as publishes
//! arrive on the broker's event bus.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerEvent};
use crate::codec::coap::{CoapCode, CoapMessage, CoapType};
use crate::protocol::QoS;
use crate::transport::UdpDemux;

#[derive(Debug, Clone)]
pub struct CoapGatewayConfig {
    pub bind_addr: SocketAddr,
    pub mqtt_prefix: String,
    pub session_timeout: Duration,
}

struct Observer {
    remote: SocketAddr,
    token: Bytes,
    seq: AtomicU32,
}

/// Translates CoAP requests on one UDP socket into broker publish/retained/
/// subscribe operations.
pub struct CoapGateway {
    broker: Arc<Broker>,
    config: CoapGatewayConfig,
    observers: DashMap<String, Vec<Arc<Observer>>>,
    next_message_id: AtomicU16,
}

impl CoapGateway {
    pub fn new(broker: Arc<Broker>, config: CoapGatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            broker,
            config,
            observers: DashMap::new(),
            next_message_id: AtomicU16::new(1),
        })
    }

    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let (demux, mut accept_rx) = UdpDemux::bind(self.config.bind_addr, self.config.session_timeout).await?;
        info!("CoAP gateway listening on {}", self.config.bind_addr);

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
                while let Some(datagram) = conn.recv().await {
                    let request = match CoapMessage::decode(&datagram) {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!("malformed CoAP datagram from {}: {}", remote, e);
                            continue;
                        }
                    };
                    let response = gateway.handle_request(remote, request).await;
                    if let Err(e) = demux.send_to(remote, &response.encode()).await {
                        warn!("failed to send CoAP response to {}: {}", remote, e);
                    }
                }
            });
        }
        Ok(())
    }

    fn path_to_topic(&self, path: &str) -> Option<String> {
        let prefix = format!("{}/", self.config.mqtt_prefix);
        path.strip_prefix(&prefix).filter(|rest| !rest.is_empty()).map(str::to_string)
    }

    async fn handle_request(&self, remote: SocketAddr, request: CoapMessage) -> CoapMessage {
        let path = request.uri_path();
        let topic = match self.path_to_topic(&path) {
            Some(topic) => topic,
            None => return self.reply(&request, CoapCode::BAD_REQUEST_4_00, Bytes::new()),
        };

        match request.code {
            CoapCode::GET => self.handle_get(remote, &request, &topic),
            CoapCode::PUT | CoapCode::POST => {
                self.broker.publish(topic, request.payload.clone(), QoS::AtMostOnce, true);
                self.reply(&request, CoapCode::CHANGED_2_04, Bytes::new())
            }
            CoapCode::DELETE => {
                self.broker.publish(topic, Bytes::new(), QoS::AtMostOnce, true);
                self.reply(&request, CoapCode::DELETED_2_02, Bytes::new())
            }
            _ => self.reply(&request, CoapCode::BAD_REQUEST_4_00, Bytes::new()),
        }
    }

    fn handle_get(&self, remote: SocketAddr, request: &CoapMessage, topic: &str) -> CoapMessage {
        if let Some(observe) = request.observe() {
            if observe == 0 {
                self.register_observer(remote, topic, request.token.clone());
            } else {
                self.deregister_observer(remote, topic, &request.token);
            }
        }

        match self.broker.retained().get(topic) {
            Some(entry) => {
                let mut response = self.reply(request, CoapCode::CONTENT_2_05, entry.payload.clone());
                if request.observe() == Some(0) {
                    response = response.with_observe(0);
                }
                response
            }
            None => self.reply(request, CoapCode::NOT_FOUND_4_04, Bytes::new()),
        }
    }

    fn register_observer(&self, remote: SocketAddr, topic: &str, token: Bytes) {
        let observer = Arc::new(Observer { remote, token, seq: AtomicU32::new(0) });
        self.observers.entry(topic.to_string()).or_default().push(observer);
        debug!("registered CoAP observer {} on {}", remote, topic);
    }

    fn deregister_observer(&self, remote: SocketAddr, topic: &str, token: &[u8]) {
        if let Some(mut observers) = self.observers.get_mut(topic) {
            observers.retain(|o| !(o.remote == remote && o.token == token));
        }
    }

    /// Reply with the same type/token/message-id the request used
    /// (a piggybacked ACK for a Confirmable request, or a bare NON for a
    /// non-Confirmable one).
    fn reply(&self, request: &CoapMessage, code: CoapCode, payload: Bytes) -> CoapMessage {
        let msg_type = match request.msg_type {
            CoapType::Confirmable => CoapType::Acknowledgement,
            _ => CoapType::NonConfirmable,
        };
        CoapMessage {
            msg_type,
            code,
            message_id: request.message_id,
            token: request.token.clone(),
            options: Vec::new(),
            payload,
        }
    }

    fn next_message_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fan every broker publish out to observers of its exact topic. An
    /// observer whose datagram send fails (peer gone) is dropped.
    async fn forward_publishes(self: Arc<Self>, demux: Arc<UdpDemux>) {
        let mut events = self.broker.subscribe_events();
        loop {
            match events.recv().await {
                Ok(BrokerEvent::MessagePublished { topic, payload, .. }) => {
                    self.notify_observers(&demux, &topic, payload).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn notify_observers(&self, demux: &Arc<UdpDemux>, topic: &str, payload: Bytes) {
        let Some(observers) = self.observers.get(topic).map(|o| o.value().clone()) else {
            return;
        };
        let mut surviving = Vec::with_capacity(observers.len());
        for observer in observers {
            let seq = observer.seq.fetch_add(1, Ordering::Relaxed) + 1;
            let notification = CoapMessage {
                msg_type: CoapType::NonConfirmable,
                code: CoapCode::CONTENT_2_05,
                message_id: self.next_message_id(),
                token: observer.token.clone(),
                options: Vec::new(),
                payload: payload.clone(),
            }
            .with_observe(seq);

            if demux.send_to(observer.remote, &notification.encode()).await.is_ok() {
                surviving.push(observer);
            } else {
                debug!("dropping CoAP observer {} on {} (send failed)", observer.remote, topic);
            }
        }
        if let Some(mut entry) = self.observers.get_mut(topic) {
            *entry = surviving;
        }
    }
}
