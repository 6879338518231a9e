//! Connection ↔ session subscription table and broadcast fan-out.
//!
//! Each connection owns a bounded outbound ring buffer. Broadcasts never
//! block the producer: when the ring is full the oldest queued message is
//! evicted to make room for the new one and the connection is flagged
//! desynced; the socket pump surfaces a `desync` notification so the
//! client can re-fetch history.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::protocol::ServerMessage;

pub type ConnectionId = u64;

pub const CONNECTION_QUEUE_DEPTH: usize = 256;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-connection ring buffer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Channel {
    queue: Mutex<VecDeque<ServerMessage>>,
    notify: Notify,
    desynced: AtomicBool,
    closed: AtomicBool,
}

impl Channel {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(CONNECTION_QUEUE_DEPTH)),
            notify: Notify::new(),
            desynced: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a message, evicting the oldest entry when full so the
    /// newest always survives.
    fn push(&self, msg: ServerMessage) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.queue.lock();
            if queue.len() >= CONNECTION_QUEUE_DEPTH {
                queue.pop_front();
                self.desynced.store(true, Ordering::Release);
            }
            queue.push_back(msg);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<ServerMessage> {
        self.queue.lock().pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Sender half of a registered connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    channel: Arc<Channel>,
}

impl ConnectionHandle {
    fn send(&self, msg: ServerMessage) {
        self.channel.push(msg);
    }

    /// Direct (non-broadcast) delivery to this connection.
    pub fn push(&self, msg: ServerMessage) {
        self.send(msg);
    }

    /// Read-and-clear the desync flag (checked by the socket pump).
    pub fn take_desynced(&self) -> bool {
        self.channel.desynced.swap(false, Ordering::AcqRel)
    }
}

/// Receiving end drained by the socket pump.
pub struct ConnectionReceiver {
    channel: Arc<Channel>,
}

impl ConnectionReceiver {
    /// Next queued message; resolves with `None` once the connection has
    /// been unregistered and the queue is drained.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            // Register interest before checking so a concurrent push
            // cannot slip between the check and the await.
            let notified = self.channel.notify.notified();
            if let Some(msg) = self.channel.pop() {
                return Some(msg);
            }
            if self.channel.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Non-blocking variant used by tests.
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.channel.pop()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscription table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Tables {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    by_session: HashMap<String, HashSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, HashSet<String>>,
}

pub struct SubscriptionTable {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                connections: HashMap::new(),
                by_session: HashMap::new(),
                by_connection: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a connection; returns its handle and the receiving end for
    /// the socket pump.
    pub fn register(&self) -> (ConnectionHandle, ConnectionReceiver) {
        let channel = Arc::new(Channel::new());
        let handle = ConnectionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            channel: Arc::clone(&channel),
        };
        let mut tables = self.tables.lock();
        tables.connections.insert(handle.id, handle.clone());
        tables.by_connection.insert(handle.id, HashSet::new());
        (handle, ConnectionReceiver { channel })
    }

    /// Remove a connection and all its subscriptions (disconnect).
    pub fn unregister(&self, connection_id: ConnectionId) {
        let mut tables = self.tables.lock();
        if let Some(handle) = tables.connections.remove(&connection_id) {
            handle.channel.close();
        }
        if let Some(sessions) = tables.by_connection.remove(&connection_id) {
            for session in sessions {
                if let Some(conns) = tables.by_session.get_mut(&session) {
                    conns.remove(&connection_id);
                    if conns.is_empty() {
                        tables.by_session.remove(&session);
                    }
                }
            }
        }
    }

    pub fn subscribe(&self, session_id: &str, connection_id: ConnectionId) {
        let mut tables = self.tables.lock();
        if !tables.connections.contains_key(&connection_id) {
            return;
        }
        tables
            .by_session
            .entry(session_id.to_owned())
            .or_default()
            .insert(connection_id);
        tables
            .by_connection
            .entry(connection_id)
            .or_default()
            .insert(session_id.to_owned());
    }

    /// Sessions a connection is subscribed to.
    pub fn sessions_of(&self, connection_id: ConnectionId) -> Vec<String> {
        self.tables
            .lock()
            .by_connection
            .get(&connection_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.tables
            .lock()
            .by_session
            .get(session_id)
            .map_or(0, HashSet::len)
    }

    /// Broadcast to every subscriber of a session, optionally excluding
    /// one connection (echo suppression for the sender).
    pub fn send_to_session(
        &self,
        session_id: &str,
        mut msg: ServerMessage,
        exclude: Option<ConnectionId>,
    ) {
        msg.ensure_session_id(session_id);
        let handles: Vec<ConnectionHandle> = {
            let tables = self.tables.lock();
            match tables.by_session.get(session_id) {
                Some(ids) => ids
                    .iter()
                    .filter(|id| Some(**id) != exclude)
                    .filter_map(|id| tables.connections.get(id).cloned())
                    .collect(),
                None => return,
            }
        };
        for handle in handles {
            handle.send(msg.clone());
        }
    }

    /// Broadcast to every registered connection.
    pub fn send_to_all(&self, msg: ServerMessage) {
        let handles: Vec<ConnectionHandle> =
            self.tables.lock().connections.values().cloned().collect();
        for handle in handles {
            handle.send(msg.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> ServerMessage {
        ServerMessage::TextDelta {
            session_id: None,
            response_id: "r".into(),
            text: text.into(),
        }
    }

    fn delta_text(msg: &ServerMessage) -> String {
        match msg {
            ServerMessage::TextDelta { text, .. } => text.clone(),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers_with_session_id_injected() {
        let table = SubscriptionTable::new();
        let (conn, mut rx) = table.register();
        table.subscribe("s1", conn.id);

        table.send_to_session("s1", delta("hi"), None);
        match rx.recv().await.unwrap() {
            ServerMessage::TextDelta { session_id, text, .. } => {
                assert_eq!(session_id.as_deref(), Some("s1"));
                assert_eq!(text, "hi");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn excluded_connection_is_skipped() {
        let table = SubscriptionTable::new();
        let (sender_conn, mut sender_rx) = table.register();
        let (peer_conn, mut peer_rx) = table.register();
        table.subscribe("s1", sender_conn.id);
        table.subscribe("s1", peer_conn.id);

        table.send_to_session("s1", delta("x"), Some(sender_conn.id));
        assert!(peer_rx.try_recv().is_some());
        assert!(sender_rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn unregister_removes_all_subscriptions() {
        let table = SubscriptionTable::new();
        let (conn, mut rx) = table.register();
        table.subscribe("s1", conn.id);
        table.subscribe("s2", conn.id);
        assert_eq!(table.subscriber_count("s1"), 1);

        table.unregister(conn.id);
        assert_eq!(table.subscriber_count("s1"), 0);
        assert_eq!(table.subscriber_count("s2"), 0);

        table.send_to_session("s1", delta("gone"), None);
        assert!(rx.try_recv().is_none());
        // A closed, drained channel reports end-of-stream.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_consumer_drops_oldest_and_is_flagged_desynced() {
        let table = SubscriptionTable::new();
        let (conn, mut rx) = table.register();
        table.subscribe("s1", conn.id);

        let overflow = 10;
        for i in 0..CONNECTION_QUEUE_DEPTH + overflow {
            table.send_to_session("s1", delta(&i.to_string()), None);
        }
        assert!(conn.take_desynced());
        // Flag clears after being taken.
        assert!(!conn.take_desynced());

        // The oldest messages were evicted; the newest always survives.
        let mut received = Vec::new();
        while let Some(msg) = rx.try_recv() {
            received.push(delta_text(&msg));
        }
        assert_eq!(received.len(), CONNECTION_QUEUE_DEPTH);
        assert_eq!(received.first().unwrap(), &overflow.to_string());
        assert_eq!(
            received.last().unwrap(),
            &(CONNECTION_QUEUE_DEPTH + overflow - 1).to_string()
        );
    }

    #[tokio::test]
    async fn send_to_all_reaches_unsubscribed_connections() {
        let table = SubscriptionTable::new();
        let (_conn, mut rx) = table.register();
        table.send_to_all(ServerMessage::Desync);
        assert_eq!(rx.recv().await.unwrap(), ServerMessage::Desync);
    }
}
