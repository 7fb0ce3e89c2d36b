//! UDP demultiplexing
//!
//! A single bound `UdpSocket` fans incoming datagrams out into one virtual
//! connection per `(remote address, remote port)`, each with its own bounded
//! inbox. This is the datagram-side counterpart to the stream-oriented
//! `broker::Connection<S>`: where that type is generic over an
//! `AsyncRead + AsyncWrite` byte stream, a `UdpVirtualConnection` exposes
//! whole-datagram recv/send instead, since CoAP and MQTT-SN frame one
//! message per UDP packet rather than a continuous byte stream.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Depth of each virtual connection's inbound datagram queue. Once full,
/// the oldest queued datagram is dropped to make room for the new one
/// rather than applying backpressure to the shared recv loop.
const DEFAULT_INBOX_CAPACITY: usize = 32;

/// A bounded, drop-oldest queue shared between the demux recv loop (producer)
/// and a single `UdpVirtualConnection` (consumer).
struct Inbox {
    queue: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    capacity: usize,
    closed: std::sync::atomic::AtomicBool,
}

impl Inbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn push(&self, datagram: Bytes) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(datagram);
        drop(queue);
        self.notify.notify_one();
    }

    /// Wake the consumer with no further datagrams coming — the demux has
    /// expired this peer's slot.
    fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Release);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<Bytes> {
        loop {
            if let Some(datagram) = self.queue.lock().pop_front() {
                return Some(datagram);
            }
            if self.closed.load(std::sync::atomic::Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

struct Slot {
    inbox: Arc<Inbox>,
    last_seen: Mutex<Instant>,
}

/// One `(remote-addr, remote-port)` pairing multiplexed off the shared socket.
pub struct UdpVirtualConnection {
    pub remote: SocketAddr,
    socket: Arc<UdpSocket>,
    inbox: Arc<Inbox>,
}

impl UdpVirtualConnection {
    /// Receive the next datagram addressed to this peer, or `None` once this
    /// slot has been idle-expired by the demux's sweep loop.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbox.pop().await
    }

    pub async fn send(&self, data: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(data, self.remote).await.map(|_| ())
    }
}

/// Demultiplexes one UDP socket into per-peer virtual connections.
pub struct UdpDemux {
    socket: Arc<UdpSocket>,
    slots: DashMap<SocketAddr, Arc<Slot>>,
    inbox_capacity: usize,
    idle_timeout: Duration,
}

impl UdpDemux {
    /// Bind a UDP socket and start demultiplexing. Returns the demux handle
    /// (used to send datagrams back out) and a channel yielding a
    /// `UdpVirtualConnection` the first time each new peer is seen —
    /// analogous to `Listener::accept`.
    pub async fn bind(
        addr: SocketAddr,
        idle_timeout: Duration,
    ) -> std::io::Result<(Arc<Self>, mpsc::Receiver<UdpVirtualConnection>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let demux = Arc::new(Self {
            socket,
            slots: DashMap::new(),
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            idle_timeout,
        });

        let (accept_tx, accept_rx) = mpsc::channel(128);
        tokio::spawn(demux.clone().recv_loop(accept_tx));
        tokio::spawn(demux.clone().sweep_loop());

        Ok((demux, accept_rx))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send_to(&self, remote: SocketAddr, data: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(data, remote).await.map(|_| ())
    }

    async fn recv_loop(self: Arc<Self>, accept_tx: mpsc::Sender<UdpVirtualConnection>) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (len, remote) = match self.socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("UDP recv error: {}", e);
                    continue;
                }
            };
            let datagram = Bytes::copy_from_slice(&buf[..len]);

            let slot = match self.slots.get(&remote) {
                Some(slot) => slot.clone(),
                None => {
                    let slot = Arc::new(Slot {
                        inbox: Arc::new(Inbox::new(self.inbox_capacity)),
                        last_seen: Mutex::new(Instant::now()),
                    });
                    self.slots.insert(remote, slot.clone());
                    let conn = UdpVirtualConnection {
                        remote,
                        socket: self.socket.clone(),
                        inbox: slot.inbox.clone(),
                    };
                    if accept_tx.send(conn).await.is_err() {
                        debug!("UDP demux accept channel closed, stopping recv loop");
                        return;
                    }
                    slot
                }
            };
            *slot.last_seen.lock() = Instant::now();
            slot.inbox.push(datagram);
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.idle_timeout / 2);
        loop {
            interval.tick().await;
            let now = Instant::now();
            let stale: Vec<SocketAddr> = self
                .slots
                .iter()
                .filter(|entry| now.duration_since(*entry.value().last_seen.lock()) > self.idle_timeout)
                .map(|entry| *entry.key())
                .collect();
            for addr in stale {
                if let Some((_, slot)) = self.slots.remove(&addr) {
                    slot.inbox.close();
                }
                debug!("UDP virtual connection to {} expired (idle)", addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbox_drops_oldest_when_full() {
        let inbox = Inbox::new(2);
        inbox.push(Bytes::from_static(b"a"));
        inbox.push(Bytes::from_static(b"b"));
        inbox.push(Bytes::from_static(b"c"));
        let remaining: Vec<_> = inbox.queue.lock().iter().cloned().collect();
        assert_eq!(remaining, vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]);
    }
}
