//! CoAP and MQTT-SN Gateway Integration Tests
//!
//! Exercises the UDP-based protocol gateways against a running broker,
//! the same way `integration.rs` exercises the TCP MQTT listener.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use vibemq::broker::{Broker, BrokerConfig};
use vibemq::codec::coap::{CoapCode, CoapMessage, CoapType};
use vibemq::codec::sn::{SnFlags, SnMessage, SnTopic, TopicIdType};
use vibemq::protocol::QoS;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(23000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_config(tcp_port: u16, coap_port: Option<u16>, sn_port: Option<u16>) -> BrokerConfig {
    BrokerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], tcp_port)),
        tls_bind_addr: None,
        tls_config: None,
        ws_bind_addr: None,
        ws_path: "/mqtt".to_string(),
        max_connections: 100,
        max_packet_size: 1024 * 1024,
        default_keep_alive: 60,
        max_keep_alive: 300,
        session_expiry_check_interval: Duration::from_secs(60),
        receive_maximum: 65535,
        max_qos: QoS::ExactlyOnce,
        retain_available: true,
        wildcard_subscription_available: true,
        subscription_identifiers_available: true,
        shared_subscriptions_available: true,
        max_topic_alias: 65535,
        num_workers: 2,
        sys_topics_enabled: false,
        sys_topics_interval: 10,
        max_inflight: 32,
        max_queued_messages: 1000,
        max_awaiting_rel: 100,
        retry_interval: Duration::from_secs(30),
        outbound_channel_capacity: 1024,
        max_topic_levels: 128,
        proxy_protocol: Default::default(),
        tls_proxy_protocol: Default::default(),
        ws_proxy_protocol: Default::default(),
        coap_bind_addr: coap_port.map(|p| SocketAddr::from(([127, 0, 0, 1], p))),
        coap_mqtt_prefix: "coap".to_string(),
        coap_session_timeout: Duration::from_secs(300),
        sn_bind_addr: sn_port.map(|p| SocketAddr::from(([127, 0, 0, 1], p))),
    }
}

async fn send_recv(socket: &UdpSocket, to: SocketAddr, data: &[u8]) -> Bytes {
    socket.send_to(data, to).await.expect("send_to failed");
    let mut buf = vec![0u8; 4096];
    let n = timeout(Duration::from_secs(2), socket.recv(&mut buf))
        .await
        .expect("timed out waiting for gateway response")
        .expect("recv failed");
    Bytes::copy_from_slice(&buf[..n])
}

#[tokio::test]
async fn coap_put_then_get_round_trips_retained_payload() {
    let tcp_port = next_port();
    let coap_port = next_port();
    let config = test_config(tcp_port, Some(coap_port), None);
    let broker = Arc::new(Broker::new(config));
    let broker_handle = tokio::spawn(async move {
        let _ = broker.run().await;
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let coap_addr = SocketAddr::from(([127, 0, 0, 1], coap_port));
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let put = CoapMessage {
        msg_type: CoapType::Confirmable,
        code: CoapCode::PUT,
        message_id: 1,
        token: Bytes::from_static(b"tok1"),
        options: Vec::new(),
        payload: Bytes::from_static(b"23.5"),
    }
    .with_uri_path("coap/sensors/temp");

    let response = send_recv(&client, coap_addr, &put.encode()).await;
    let decoded = CoapMessage::decode(&response).unwrap();
    assert_eq!(decoded.code, CoapCode::CHANGED_2_04);
    assert_eq!(decoded.message_id, 1);

    let get = CoapMessage {
        msg_type: CoapType::Confirmable,
        code: CoapCode::GET,
        message_id: 2,
        token: Bytes::from_static(b"tok2"),
        options: Vec::new(),
        payload: Bytes::new(),
    }
    .with_uri_path("coap/sensors/temp");

    let response = send_recv(&client, coap_addr, &get.encode()).await;
    let decoded = CoapMessage::decode(&response).unwrap();
    assert_eq!(decoded.code, CoapCode::CONTENT_2_05);
    assert_eq!(&decoded.payload[..], b"23.5");

    broker_handle.abort();
}

#[tokio::test]
async fn coap_get_on_unknown_topic_returns_not_found() {
    let tcp_port = next_port();
    let coap_port = next_port();
    let config = test_config(tcp_port, Some(coap_port), None);
    let broker = Arc::new(Broker::new(config));
    let broker_handle = tokio::spawn(async move {
        let _ = broker.run().await;
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let coap_addr = SocketAddr::from(([127, 0, 0, 1], coap_port));
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let get = CoapMessage {
        msg_type: CoapType::Confirmable,
        code: CoapCode::GET,
        message_id: 5,
        token: Bytes::new(),
        options: Vec::new(),
        payload: Bytes::new(),
    }
    .with_uri_path("coap/never/published");

    let response = send_recv(&client, coap_addr, &get.encode()).await;
    let decoded = CoapMessage::decode(&response).unwrap();
    assert_eq!(decoded.code, CoapCode::NOT_FOUND_4_04);

    broker_handle.abort();
}

#[tokio::test]
async fn coap_observer_receives_notification_on_publish() {
    let tcp_port = next_port();
    let coap_port = next_port();
    let config = test_config(tcp_port, Some(coap_port), None);
    let broker = Arc::new(Broker::new(config));
    let broker_handle = tokio::spawn(async move {
        let _ = broker.run().await;
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let coap_addr = SocketAddr::from(([127, 0, 0, 1], coap_port));
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let observe = CoapMessage {
        msg_type: CoapType::Confirmable,
        code: CoapCode::GET,
        message_id: 10,
        token: Bytes::from_static(b"obs"),
        options: Vec::new(),
        payload: Bytes::new(),
    }
    .with_uri_path("coap/sensors/humidity")
    .with_observe(0);

    // Initial ack for the registration request (404 since nothing retained yet).
    let _ = send_recv(&client, coap_addr, &observe.encode()).await;

    // A second client publishes to the same resource.
    let publisher = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let put = CoapMessage {
        msg_type: CoapType::NonConfirmable,
        code: CoapCode::PUT,
        message_id: 11,
        token: Bytes::new(),
        options: Vec::new(),
        payload: Bytes::from_static(b"61"),
    }
    .with_uri_path("coap/sensors/humidity");
    let _ = send_recv(&publisher, coap_addr, &put.encode()).await;

    // The observer should receive an unsolicited notification with the new value.
    let mut buf = vec![0u8; 4096];
    let n = timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .expect("timed out waiting for observe notification")
        .expect("recv failed");
    let notification = CoapMessage::decode(&buf[..n]).unwrap();
    assert_eq!(notification.code, CoapCode::CONTENT_2_05);
    assert_eq!(&notification.payload[..], b"61");
    assert_eq!(notification.observe(), Some(1));

    broker_handle.abort();
}

#[tokio::test]
async fn sn_connect_register_publish_is_acknowledged() {
    let tcp_port = next_port();
    let sn_port = next_port();
    let config = test_config(tcp_port, None, Some(sn_port));
    let broker = Arc::new(Broker::new(config));
    let broker_handle = tokio::spawn(async move {
        let _ = broker.run().await;
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let sn_addr = SocketAddr::from(([127, 0, 0, 1], sn_port));
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let connect = SnMessage::Connect {
        flags: SnFlags::default(),
        duration: 300,
        client_id: "sn-client-1".to_string(),
    };
    let response = send_recv(&client, sn_addr, &connect.encode()).await;
    assert_eq!(SnMessage::decode(&response).unwrap(), SnMessage::ConnAck { return_code: 0 });

    let register = SnMessage::Register { topic_id: 0, msg_id: 1, topic_name: "sensors/temp".to_string() };
    let response = send_recv(&client, sn_addr, &register.encode()).await;
    let regack = SnMessage::decode(&response).unwrap();
    let topic_id = match regack {
        SnMessage::RegAck { topic_id, msg_id: 1, return_code: 0 } => topic_id,
        other => panic!("expected REGACK, got {:?}", other),
    };

    let publish = SnMessage::Publish {
        flags: SnFlags { qos: QoS::AtLeastOnce, ..SnFlags::default() },
        topic_id,
        msg_id: 2,
        data: Bytes::from_static(b"19.2"),
    };
    let response = send_recv(&client, sn_addr, &publish.encode()).await;
    assert_eq!(
        SnMessage::decode(&response).unwrap(),
        SnMessage::PubAck { topic_id, msg_id: 2, return_code: 0 }
    );

    broker_handle.abort();
}

#[tokio::test]
async fn sn_subscriber_receives_publish_from_another_client() {
    let tcp_port = next_port();
    let sn_port = next_port();
    let config = test_config(tcp_port, None, Some(sn_port));
    let broker = Arc::new(Broker::new(config));
    let broker_handle = tokio::spawn(async move {
        let _ = broker.run().await;
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let sn_addr = SocketAddr::from(([127, 0, 0, 1], sn_port));

    // Subscriber connects and subscribes by name.
    let subscriber = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let connect = SnMessage::Connect {
        flags: SnFlags::default(),
        duration: 300,
        client_id: "sn-subscriber".to_string(),
    };
    let _ = send_recv(&subscriber, sn_addr, &connect.encode()).await;

    let subscribe = SnMessage::Subscribe {
        flags: SnFlags::default(),
        msg_id: 1,
        topic: SnTopic::Name("sensors/#".to_string()),
    };
    let response = send_recv(&subscriber, sn_addr, &subscribe.encode()).await;
    match SnMessage::decode(&response).unwrap() {
        SnMessage::SubAck { return_code: 0, .. } => {}
        other => panic!("expected SUBACK, got {:?}", other),
    }

    // Publisher connects, registers and publishes.
    let publisher = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let connect = SnMessage::Connect {
        flags: SnFlags::default(),
        duration: 300,
        client_id: "sn-publisher".to_string(),
    };
    let _ = send_recv(&publisher, sn_addr, &connect.encode()).await;

    let register =
        SnMessage::Register { topic_id: 0, msg_id: 1, topic_name: "sensors/wind".to_string() };
    let response = send_recv(&publisher, sn_addr, &register.encode()).await;
    let topic_id = match SnMessage::decode(&response).unwrap() {
        SnMessage::RegAck { topic_id, .. } => topic_id,
        other => panic!("expected REGACK, got {:?}", other),
    };

    let publish = SnMessage::Publish {
        flags: SnFlags { qos: QoS::AtMostOnce, ..SnFlags::default() },
        topic_id,
        msg_id: 0,
        data: Bytes::from_static(b"12"),
    };
    publisher.send_to(&publish.encode(), sn_addr).await.unwrap();

    // Subscriber should see the forwarded publish in its own topic-id space.
    let mut buf = vec![0u8; 4096];
    let n = timeout(Duration::from_secs(2), subscriber.recv(&mut buf))
        .await
        .expect("timed out waiting for forwarded publish")
        .expect("recv failed");
    match SnMessage::decode(&buf[..n]).unwrap() {
        SnMessage::Publish { flags, data, .. } => {
            assert_eq!(flags.topic_id_type, TopicIdType::Normal);
            assert_eq!(&data[..], b"12");
        }
        other => panic!("expected forwarded PUBLISH, got {:?}", other),
    }

    broker_handle.abort();
}
