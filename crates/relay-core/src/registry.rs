//! Registry of live producer connections.
//!
//! The registry is shared by every socket task, the heartbeat and the
//! presence tracker. Each operation is a single step on a sharded concurrent
//! map, so callers never need to hold anything across two calls.

use crate::liveness::{HeartbeatReport, Liveness, TickAction};
use crate::presence::PresenceSnapshot;
use crate::subscriptions::Topic;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Identifier of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Control signal from the heartbeat to a connection's socket task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Send a transport-level ping.
    Ping,
    /// Close the transport; the connection has already been unregistered.
    Terminate,
}

/// Receiving half of a connection's signal channel.
pub type SignalReceiver = mpsc::UnboundedReceiver<Signal>;

#[derive(Debug)]
struct ConnectionEntry {
    liveness: Liveness,
    topic: Option<Topic>,
    signals: mpsc::UnboundedSender<Signal>,
}

/// Concurrent registry of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly accepted connection. It starts alive with no topic.
    ///
    /// The returned receiver yields heartbeat signals for the connection.
    pub fn register(&self) -> (ConnectionId, SignalReceiver) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (signals, receiver) = mpsc::unbounded_channel();

        self.connections.insert(
            id,
            ConnectionEntry {
                liveness: Liveness::Alive,
                topic: None,
                signals,
            },
        );

        debug!(connection = %id, total = self.connections.len(), "Registered connection");
        (id, receiver)
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if removed {
            debug!(connection = %id, total = self.connections.len(), "Unregistered connection");
        }
        removed
    }

    /// Set the connection's topic, replacing any previous one.
    ///
    /// Returns `false` if the connection is not registered.
    pub fn declare_topic(&self, id: ConnectionId, topic: impl Into<Topic>) -> bool {
        let topic = topic.into();
        match self.connections.get_mut(&id) {
            Some(mut entry) => {
                debug!(connection = %id, topic = %topic, "Declared topic");
                entry.topic = Some(topic);
                true
            }
            None => false,
        }
    }

    /// Clear the connection's topic.
    ///
    /// Returns `false` if the connection is not registered.
    pub fn clear_topic(&self, id: ConnectionId) -> bool {
        match self.connections.get_mut(&id) {
            Some(mut entry) => {
                debug!(connection = %id, "Cleared topic");
                entry.topic = None;
                true
            }
            None => false,
        }
    }

    /// The connection's last declared topic.
    #[must_use]
    pub fn topic(&self, id: ConnectionId) -> Option<Topic> {
        self.connections.get(&id).and_then(|e| e.topic.clone())
    }

    /// Record a pong from the connection.
    pub fn mark_alive(&self, id: ConnectionId) {
        if let Some(mut entry) = self.connections.get_mut(&id) {
            trace!(connection = %id, "Pong received");
            entry.liveness.pong();
        }
    }

    /// Advance the connection's liveness by one heartbeat tick. An alive
    /// connection is sent a ping and becomes pending.
    ///
    /// Returns what the tick asks for, `None` if the connection is not
    /// registered. A connection whose signal receiver is gone must be evicted.
    pub fn mark_pending_pong(&self, id: ConnectionId) -> Option<TickAction> {
        let mut entry = self.connections.get_mut(&id)?;
        let action = entry.liveness.tick();
        if action == TickAction::Ping && entry.signals.send(Signal::Ping).is_err() {
            return Some(TickAction::Evict);
        }
        Some(action)
    }

    /// The connection's liveness, `None` if not registered.
    #[must_use]
    pub fn liveness(&self, id: ConnectionId) -> Option<Liveness> {
        self.connections.get(&id).map(|e| e.liveness)
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Count registered connections by declared topic. Connections without a
    /// topic are not counted.
    #[must_use]
    pub fn snapshot_by_topic(&self) -> PresenceSnapshot {
        let mut snapshot = PresenceSnapshot::new();
        for entry in self.connections.iter() {
            if let Some(topic) = &entry.topic {
                *snapshot.entry(topic.clone()).or_insert(0) += 1;
            }
        }
        snapshot
    }

    /// Advance every connection's liveness by one tick, pinging live ones and
    /// evicting dead ones.
    pub(crate) fn heartbeat(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();

        for id in ids {
            match self.mark_pending_pong(id) {
                Some(TickAction::Ping) => report.pinged += 1,
                Some(TickAction::Evict) => {
                    // A pong that arrived since the tick keeps the connection.
                    let removed = self
                        .connections
                        .remove_if(&id, |_, entry| entry.liveness == Liveness::PendingPong);
                    if let Some((_, entry)) = removed {
                        let _ = entry.signals.send(Signal::Terminate);
                        report.evicted.push(id);
                    }
                }
                None => {}
            }
        }

        report.evicted.sort();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister() {
        let registry = ConnectionRegistry::new();

        let (a, _rx_a) = registry.register();
        let (b, _rx_b) = registry.register();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.liveness(a), Some(Liveness::Alive));
        assert_eq!(registry.topic(a), None);

        assert!(registry.unregister(a));
        assert!(!registry.is_registered(a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = registry.register();

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
        assert!(registry.snapshot_by_topic().is_empty());
    }

    #[test]
    fn test_declare_topic_last_write_wins() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = registry.register();

        assert!(registry.declare_topic(id, "A"));
        assert!(registry.declare_topic(id, "B"));
        assert_eq!(registry.topic(id).as_deref(), Some("B"));

        assert!(registry.clear_topic(id));
        assert_eq!(registry.topic(id), None);

        registry.unregister(id);
        assert!(!registry.declare_topic(id, "C"));
    }

    #[test]
    fn test_snapshot_by_topic() {
        let registry = ConnectionRegistry::new();
        let (a1, _r1) = registry.register();
        let (a2, _r2) = registry.register();
        let (b, _r3) = registry.register();
        let (_unset, _r4) = registry.register();

        registry.declare_topic(a1, "A");
        registry.declare_topic(a2, "A");
        registry.declare_topic(b, "B");

        let snapshot = registry.snapshot_by_topic();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["A"], 2);
        assert_eq!(snapshot["B"], 1);

        registry.unregister(a1);
        assert_eq!(registry.snapshot_by_topic()["A"], 1);
    }

    #[test]
    fn test_mark_liveness() {
        let registry = ConnectionRegistry::new();
        let (id, mut rx) = registry.register();

        assert_eq!(registry.mark_pending_pong(id), Some(TickAction::Ping));
        assert_eq!(registry.liveness(id), Some(Liveness::PendingPong));
        assert_eq!(rx.try_recv().unwrap(), Signal::Ping);

        registry.mark_alive(id);
        assert_eq!(registry.liveness(id), Some(Liveness::Alive));

        registry.mark_pending_pong(id);
        assert_eq!(registry.mark_pending_pong(id), Some(TickAction::Evict));

        // Unknown connections are ignored.
        registry.unregister(id);
        registry.mark_alive(id);
        assert_eq!(registry.liveness(id), None);
        assert_eq!(registry.mark_pending_pong(id), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_and_snapshot() {
        let registry = std::sync::Arc::new(ConnectionRegistry::new());

        let mut handles = Vec::new();
        for i in 0..64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let (id, _rx) = registry.register();
                registry.declare_topic(id, if i % 2 == 0 { "even" } else { "odd" });
                let _ = registry.snapshot_by_topic();
                if i % 4 == 0 {
                    registry.unregister(id);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = registry.snapshot_by_topic();
        assert_eq!(snapshot["even"], 16);
        assert_eq!(snapshot["odd"], 32);
        assert_eq!(registry.len(), 48);
    }
}
