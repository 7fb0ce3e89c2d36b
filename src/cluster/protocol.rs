//! Cluster Protocol Messages
//!
//! Defines the binary protocol used for inter-node communication.
//! Messages are serialized using bincode for efficiency.

use bincode::{Decode, Encode};

/// Protocol version for compatibility checking
pub const CLUSTER_PROTOCOL_VERSION: u8 = 2;

/// Messages exchanged between cluster nodes over TCP
#[derive(Debug, Clone, Encode, Decode)]
pub enum ClusterMessage {
    /// Handshake sent when connecting to a peer
    Hello {
        /// Node ID of the sender
        node_id: String,
        /// Protocol version
        version: u8,
        /// Name of the cluster the sender believes it's joining. A mismatch
        /// against the receiver's own name causes the connection to be
        /// rejected and closed.
        cluster_name: String,
        /// Port the sender's cluster listener accepts connections on, so the
        /// receiver can dial back if it doesn't already have an outbound
        /// connection to this peer.
        listen_port: u16,
    },

    /// Handshake acknowledgment
    HelloAck {
        /// Node ID of the responder
        node_id: String,
        /// Protocol version
        version: u8,
        /// Cluster name of the responder, echoed back for symmetry
        cluster_name: String,
        /// Port the responder's cluster listener accepts connections on
        listen_port: u16,
    },

    /// Forward a published message to a peer
    ForwardedPublish {
        /// Node ID that originally received the publish from a client
        origin_node_id: String,
        /// Unique id for this message, used for dedup on receipt
        message_uuid: [u8; 16],
        /// Topic of the message
        topic: String,
        /// Message payload
        payload: Vec<u8>,
        /// QoS level (0, 1, or 2)
        qos: u8,
        /// Retain flag
        retain: bool,
    },

    /// Full subscription state sync
    SubscriptionSync {
        /// All topic filters this node has subscribers for
        filters: Vec<String>,
    },

    /// Incremental subscription update
    SubscriptionUpdate {
        /// Filters to add
        added: Vec<String>,
        /// Filters to remove
        removed: Vec<String>,
    },

    /// Request the receiver's full retained-message set. Sent once per
    /// (re)connection.
    RetainedRequest,

    /// One retained message, part of a RetainedRequest response stream
    RetainedEntry {
        topic: String,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
    },

    /// Marks the end of a RetainedRequest response stream
    RetainedEnd,

    /// Keep-alive heartbeat
    Heartbeat,

    /// Graceful disconnect notification
    Goodbye,
}

impl ClusterMessage {
    /// Encode message to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode message from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ClusterMessage::Hello { .. } => "Hello",
            ClusterMessage::HelloAck { .. } => "HelloAck",
            ClusterMessage::ForwardedPublish { .. } => "ForwardedPublish",
            ClusterMessage::SubscriptionSync { .. } => "SubscriptionSync",
            ClusterMessage::SubscriptionUpdate { .. } => "SubscriptionUpdate",
            ClusterMessage::RetainedRequest => "RetainedRequest",
            ClusterMessage::RetainedEntry { .. } => "RetainedEntry",
            ClusterMessage::RetainedEnd => "RetainedEnd",
            ClusterMessage::Heartbeat => "Heartbeat",
            ClusterMessage::Goodbye => "Goodbye",
        }
    }
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(msg: &ClusterMessage) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let payload = msg.encode()?;
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_hello() {
        let msg = ClusterMessage::Hello {
            node_id: "node1".to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
            cluster_name: "prod".to_string(),
            listen_port: 7947,
        };

        let encoded = msg.encode().unwrap();
        let decoded = ClusterMessage::decode(&encoded).unwrap();

        match decoded {
            ClusterMessage::Hello {
                node_id,
                version,
                cluster_name,
                listen_port,
            } => {
                assert_eq!(node_id, "node1");
                assert_eq!(version, CLUSTER_PROTOCOL_VERSION);
                assert_eq!(cluster_name, "prod");
                assert_eq!(listen_port, 7947);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_encode_decode_forwarded_publish() {
        let msg = ClusterMessage::ForwardedPublish {
            origin_node_id: "node1".to_string(),
            message_uuid: [7u8; 16],
            topic: "test/topic".to_string(),
            payload: vec![1, 2, 3, 4],
            qos: 1,
            retain: true,
        };

        let encoded = msg.encode().unwrap();
        let decoded = ClusterMessage::decode(&encoded).unwrap();

        match decoded {
            ClusterMessage::ForwardedPublish {
                origin_node_id,
                message_uuid,
                topic,
                payload,
                qos,
                retain,
            } => {
                assert_eq!(origin_node_id, "node1");
                assert_eq!(message_uuid, [7u8; 16]);
                assert_eq!(topic, "test/topic");
                assert_eq!(payload, vec![1, 2, 3, 4]);
                assert_eq!(qos, 1);
                assert!(retain);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_encode_decode_subscription_sync() {
        let msg = ClusterMessage::SubscriptionSync {
            filters: vec!["topic/+".to_string(), "sensor/#".to_string()],
        };

        let encoded = msg.encode().unwrap();
        let decoded = ClusterMessage::decode(&encoded).unwrap();

        match decoded {
            ClusterMessage::SubscriptionSync { filters } => {
                assert_eq!(filters.len(), 2);
                assert_eq!(filters[0], "topic/+");
                assert_eq!(filters[1], "sensor/#");
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_encode_decode_retained_roundtrip() {
        let entry = ClusterMessage::RetainedEntry {
            topic: "device/1/state".to_string(),
            payload: vec![9, 9, 9],
            qos: 1,
            retain: true,
        };
        let encoded = entry.encode().unwrap();
        let decoded = ClusterMessage::decode(&encoded).unwrap();
        assert!(matches!(decoded, ClusterMessage::RetainedEntry { .. }));

        let end = ClusterMessage::RetainedEnd;
        let encoded = end.encode().unwrap();
        assert!(matches!(
            ClusterMessage::decode(&encoded).unwrap(),
            ClusterMessage::RetainedEnd
        ));
    }

    #[test]
    fn test_frame_message() {
        let msg = ClusterMessage::Heartbeat;
        let frame = frame_message(&msg).unwrap();

        // First 4 bytes are length
        let len = read_frame_length(&frame).unwrap();
        assert_eq!(len as usize, frame.len() - 4);

        // Decode the payload
        let decoded = ClusterMessage::decode(&frame[4..]).unwrap();
        assert!(matches!(decoded, ClusterMessage::Heartbeat));
    }

    #[test]
    fn test_type_name() {
        assert_eq!(ClusterMessage::Heartbeat.type_name(), "Heartbeat");
        assert_eq!(ClusterMessage::Goodbye.type_name(), "Goodbye");
        assert_eq!(
            ClusterMessage::Hello {
                node_id: "".to_string(),
                version: 1,
                cluster_name: "".to_string(),
                listen_port: 0,
            }
            .type_name(),
            "Hello"
        );
    }
}
