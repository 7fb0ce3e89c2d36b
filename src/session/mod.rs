//! MQTT Session Management
//!
//! Handles session state, QoS 1/2 inflight tracking, message queues, and
//! packet identifier allocation for both persistent (clean_start=false) and
//! non-persistent sessions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::codec::{CachedPublish, RawPublish};
use crate::protocol::{Properties, ProtocolVersion, Publish, QoS, SubscriptionOptions};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session is connected
    Connected,
    /// Session is disconnected but persisted
    Disconnected,
    /// Session has expired
    Expired,
}

/// QoS 2 message state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2State {
    /// PUBLISH sent, waiting for PUBREC
    WaitingPubRec,
    /// PUBREC received, PUBREL sent, waiting for PUBCOMP
    WaitingPubComp,
}

/// Outgoing inflight message state for QoS 1/2.
///
/// Three encodings of the same delivery attempt, matched to how the packet
/// reached the writer: zero-copy raw wire bytes, a pre-serialized
/// `CachedPublish` shared across subscribers, or a fully materialized
/// `Publish` (the fallback path, e.g. for retained or will messages).
#[derive(Debug, Clone)]
pub enum InflightMessage {
    /// Zero-copy path: patched from the original wire bytes of the incoming PUBLISH
    Raw {
        packet_id: u16,
        raw: Arc<RawPublish>,
        qos: QoS,
        retain: bool,
        qos2_state: Option<Qos2State>,
        sent_at: Instant,
        retry_count: u32,
    },
    /// Fan-out path: patched from a pre-serialized PUBLISH shared across subscribers
    Cached {
        packet_id: u16,
        cached: Arc<CachedPublish>,
        qos: QoS,
        retain: bool,
        qos2_state: Option<Qos2State>,
        sent_at: Instant,
        retry_count: u32,
    },
    /// Fallback path: a fully materialized PUBLISH, re-encoded on every (re)send
    Full {
        packet_id: u16,
        publish: Publish,
        qos2_state: Option<Qos2State>,
        sent_at: Instant,
        retry_count: u32,
    },
}

impl InflightMessage {
    /// Mutable access to the QoS 2 handshake state, if this message is QoS 2
    pub fn qos2_state_mut(&mut self) -> &mut Option<Qos2State> {
        match self {
            InflightMessage::Raw { qos2_state, .. } => qos2_state,
            InflightMessage::Cached { qos2_state, .. } => qos2_state,
            InflightMessage::Full { qos2_state, .. } => qos2_state,
        }
    }

    /// Timestamp this message was last sent (or resent)
    pub fn sent_at(&self) -> Instant {
        match self {
            InflightMessage::Raw { sent_at, .. } => *sent_at,
            InflightMessage::Cached { sent_at, .. } => *sent_at,
            InflightMessage::Full { sent_at, .. } => *sent_at,
        }
    }

    /// Mutable access to the retransmission counter
    pub fn retry_count_mut(&mut self) -> &mut u32 {
        match self {
            InflightMessage::Raw { retry_count, .. } => retry_count,
            InflightMessage::Cached { retry_count, .. } => retry_count,
            InflightMessage::Full { retry_count, .. } => retry_count,
        }
    }

    /// Refresh the sent-at timestamp (call on every (re)send)
    pub fn touch(&mut self) {
        let now = Instant::now();
        match self {
            InflightMessage::Raw { sent_at, .. } => *sent_at = now,
            InflightMessage::Cached { sent_at, .. } => *sent_at = now,
            InflightMessage::Full { sent_at, .. } => *sent_at = now,
        }
    }
}

/// Subscription entry in session
#[derive(Debug, Clone)]
pub struct SessionSubscription {
    /// Topic filter
    pub filter: String,
    /// Subscription options
    pub options: SubscriptionOptions,
    /// Subscription identifier (v5.0)
    pub subscription_id: Option<u32>,
}

/// Per-session resource limits, derived from broker configuration at CONNECT time
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Maximum number of messages queued while disconnected
    pub max_pending_messages: usize,
    /// Maximum number of QoS 1/2 messages inflight outbound at once
    pub max_inflight: u16,
    /// Maximum number of QoS 2 PUBLISH awaiting PUBREL at once
    pub max_awaiting_rel: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_pending_messages: 1000,
            max_inflight: 32,
            max_awaiting_rel: 100,
        }
    }
}

/// Result of queuing a message onto a disconnected session's pending queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueResult {
    /// Queued without evicting anything
    Queued,
    /// Queue was full; the oldest pending message was dropped to make room
    DroppedOldest,
}

/// Will message
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

/// Client session
pub struct Session {
    /// Client identifier
    pub client_id: Arc<str>,
    /// Protocol version
    pub protocol_version: ProtocolVersion,
    /// Session state
    pub state: SessionState,
    /// Clean start flag
    pub clean_start: bool,
    /// Session expiry interval in seconds (0 = delete on disconnect)
    pub session_expiry_interval: u32,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Last activity timestamp
    pub last_activity: Instant,
    /// Subscriptions
    pub subscriptions: HashMap<String, SessionSubscription>,
    /// Inflight outgoing messages (QoS 1/2), keyed by packet_id
    pub inflight_outgoing: HashMap<u16, InflightMessage>,
    /// Inflight incoming QoS 2 messages awaiting PUBREL, keyed by packet_id
    pub inflight_incoming: HashMap<u16, Publish>,
    /// Next packet identifier
    next_packet_id: u16,
    /// Pending messages (queued while disconnected)
    pub pending_messages: VecDeque<Publish>,
    /// Maximum pending messages
    pub max_pending_messages: usize,
    /// Maximum inflight outgoing messages
    pub max_inflight: u16,
    /// Maximum QoS 2 messages awaiting PUBREL
    pub max_awaiting_rel: usize,
    /// Receive maximum (flow control)
    pub receive_maximum: u16,
    /// Current send quota
    pub send_quota: u16,
    /// Maximum packet size
    pub max_packet_size: u32,
    /// Topic aliases (client -> server)
    pub client_topic_aliases: HashMap<u16, String>,
    /// Topic aliases (server -> client)
    pub server_topic_aliases: HashMap<String, u16>,
    /// Next server topic alias
    next_server_alias: u16,
    /// Maximum topic alias
    pub topic_alias_maximum: u16,
    /// Will message
    pub will: Option<WillMessage>,
    /// Will delay interval
    pub will_delay_interval: u32,
    /// Disconnect timestamp
    pub disconnected_at: Option<Instant>,
}

impl Session {
    pub fn new(client_id: Arc<str>, protocol_version: ProtocolVersion, limits: SessionLimits) -> Self {
        Self {
            client_id,
            protocol_version,
            state: SessionState::Connected,
            clean_start: true,
            session_expiry_interval: 0,
            keep_alive: 60,
            last_activity: Instant::now(),
            subscriptions: HashMap::new(),
            inflight_outgoing: HashMap::new(),
            inflight_incoming: HashMap::new(),
            next_packet_id: 1,
            pending_messages: VecDeque::new(),
            max_pending_messages: limits.max_pending_messages,
            max_inflight: limits.max_inflight,
            max_awaiting_rel: limits.max_awaiting_rel,
            receive_maximum: 65535,
            send_quota: 65535,
            max_packet_size: 268_435_455,
            client_topic_aliases: HashMap::new(),
            server_topic_aliases: HashMap::new(),
            next_server_alias: 1,
            topic_alias_maximum: 0,
            will: None,
            will_delay_interval: 0,
            disconnected_at: None,
        }
    }

    /// Get next available packet identifier. Monotonic mod 65535, skipping zero,
    /// and skipping any id still in use by an inflight message in either direction.
    pub fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }

            if !self.inflight_outgoing.contains_key(&id)
                && !self.inflight_incoming.contains_key(&id)
            {
                return id;
            }
        }
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Check if session has expired
    pub fn is_expired(&self) -> bool {
        if self.state != SessionState::Disconnected {
            return false;
        }

        if self.session_expiry_interval == 0 {
            return true;
        }

        if self.session_expiry_interval == 0xFFFFFFFF {
            return false; // Never expires
        }

        if let Some(disconnected_at) = self.disconnected_at {
            let elapsed = disconnected_at.elapsed();
            return elapsed.as_secs() >= self.session_expiry_interval as u64;
        }

        false
    }

    /// Check if keep alive has timed out. Per MQTT, the server may disconnect
    /// after 1.5x the declared keep-alive with no inbound traffic.
    pub fn is_keep_alive_expired(&self) -> bool {
        if self.keep_alive == 0 {
            return false;
        }

        let timeout = Duration::from_secs((self.keep_alive as u64 * 3) / 2);
        self.last_activity.elapsed() > timeout
    }

    /// Queue a message for later delivery while disconnected.
    /// Drops the oldest pending message if the queue is at capacity.
    pub fn queue_message(&mut self, publish: Publish) -> QueueResult {
        let result = if self.pending_messages.len() >= self.max_pending_messages {
            self.pending_messages.pop_front();
            QueueResult::DroppedOldest
        } else {
            QueueResult::Queued
        };
        self.pending_messages.push_back(publish);
        result
    }

    /// Get and remove pending messages
    pub fn drain_pending_messages(&mut self) -> VecDeque<Publish> {
        std::mem::take(&mut self.pending_messages)
    }

    /// Add a subscription
    pub fn add_subscription(
        &mut self,
        filter: String,
        options: SubscriptionOptions,
        subscription_id: Option<u32>,
    ) {
        self.subscriptions.insert(
            filter.clone(),
            SessionSubscription {
                filter,
                options,
                subscription_id,
            },
        );
    }

    /// Remove a subscription
    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }

    /// Get or create a topic alias for server->client direction
    pub fn get_or_create_topic_alias(&mut self, topic: &str) -> Option<u16> {
        if self.topic_alias_maximum == 0 {
            return None;
        }

        if let Some(&alias) = self.server_topic_aliases.get(topic) {
            return Some(alias);
        }

        if self.next_server_alias <= self.topic_alias_maximum {
            let alias = self.next_server_alias;
            self.next_server_alias += 1;
            self.server_topic_aliases.insert(topic.to_string(), alias);
            Some(alias)
        } else {
            None
        }
    }

    /// Resolve a client->server topic alias
    pub fn resolve_topic_alias(&self, alias: u16) -> Option<&String> {
        self.client_topic_aliases.get(&alias)
    }

    /// Register a client->server topic alias
    pub fn register_topic_alias(&mut self, alias: u16, topic: String) {
        self.client_topic_aliases.insert(alias, topic);
    }

    /// Decrement send quota (for flow control). Returns false if exhausted.
    pub fn decrement_send_quota(&mut self) -> bool {
        if self.send_quota > 0 {
            self.send_quota -= 1;
            true
        } else {
            false
        }
    }

    /// Increment send quota (on ack received)
    pub fn increment_send_quota(&mut self) {
        if self.send_quota < self.receive_maximum {
            self.send_quota += 1;
        }
    }
}

/// Thread-safe session store
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Get or create a session.
    ///
    /// `clean_start=true` always creates a fresh session. `clean_start=false`
    /// resumes an existing unexpired session if one is found, returning
    /// `session_present=true`; otherwise a fresh session is created.
    pub fn get_or_create(
        &self,
        client_id: &str,
        protocol_version: ProtocolVersion,
        clean_start: bool,
        limits: SessionLimits,
    ) -> (Arc<RwLock<Session>>, bool) {
        let client_id: Arc<str> = client_id.into();

        if !clean_start {
            if let Some(session) = self.sessions.get(&client_id) {
                let mut s = session.write();
                if !s.is_expired() {
                    s.state = SessionState::Connected;
                    s.protocol_version = protocol_version;
                    s.disconnected_at = None;
                    drop(s);
                    return (session.clone(), true);
                }
            }
        }

        let session = Arc::new(RwLock::new(Session::new(
            client_id.clone(),
            protocol_version,
            limits,
        )));
        self.sessions.insert(client_id, session.clone());
        (session, false)
    }

    /// Get a session by client ID
    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    /// Remove a session
    pub fn remove(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    /// Mark session as disconnected; removes it immediately if it has no expiry
    pub fn disconnect(&self, client_id: &str) {
        let should_remove = if let Some(session) = self.sessions.get(client_id) {
            let mut s = session.write();
            s.state = SessionState::Disconnected;
            s.disconnected_at = Some(Instant::now());
            s.session_expiry_interval == 0
        } else {
            false
        };

        // Remove after releasing the DashMap read lock to avoid deadlock
        if should_remove {
            self.sessions.remove(client_id);
        }
    }

    /// Clean up expired sessions
    pub fn cleanup_expired(&self) {
        self.sessions.retain(|_, session| {
            let s = session.read();
            !s.is_expired()
        });
    }

    /// Get session count
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_limits() -> SessionLimits {
        SessionLimits {
            max_pending_messages: 4,
            max_inflight: 8,
            max_awaiting_rel: 8,
        }
    }

    #[test]
    fn next_packet_id_skips_zero_and_in_use() {
        let mut session = Session::new(Arc::from("c1"), ProtocolVersion::V5, test_limits());
        session.next_packet_id = 65535;
        let id = session.next_packet_id();
        assert_eq!(id, 65535);
        let id2 = session.next_packet_id();
        assert_eq!(id2, 1);
    }

    #[test]
    fn queue_message_drops_oldest_when_full() {
        let mut session = Session::new(Arc::from("c1"), ProtocolVersion::V5, test_limits());
        for i in 0..4u8 {
            let publish = Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: Arc::from(format!("t/{i}")),
                packet_id: None,
                payload: Bytes::new(),
                properties: Properties::default(),
            };
            assert_eq!(session.queue_message(publish), QueueResult::Queued);
        }
        let overflow = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from("t/overflow"),
            packet_id: None,
            payload: Bytes::new(),
            properties: Properties::default(),
        };
        assert_eq!(session.queue_message(overflow), QueueResult::DroppedOldest);
        assert_eq!(session.pending_messages.len(), 4);
        assert_eq!(session.pending_messages.front().unwrap().topic.as_ref(), "t/1");
    }

    #[test]
    fn keep_alive_expiry_uses_1_5x() {
        let mut session = Session::new(Arc::from("c1"), ProtocolVersion::V5, test_limits());
        session.keep_alive = 0;
        assert!(!session.is_keep_alive_expired());
    }

    #[test]
    fn session_store_resume_requires_matching_client_id() {
        let store = SessionStore::new();
        let (session, present) = store.get_or_create("c1", ProtocolVersion::V5, true, test_limits());
        assert!(!present);
        {
            let mut s = session.write();
            s.clean_start = false;
            s.session_expiry_interval = 3600;
        }
        store.disconnect("c1");
        let (_resumed, present) = store.get_or_create("c1", ProtocolVersion::V5, false, test_limits());
        assert!(present);
    }
}
