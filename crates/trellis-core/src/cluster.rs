//! Cluster replication of subscription interest.
//!
//! Locally raised subscription events are turned into [`ClusterEvent`]s and queued
//! for the gossip layer by [`ClusterNotifier`]. On the receiving node each remote
//! node is represented by a [`Peer`], which registers a single
//! [`PeerSubscriber`] proxy in the trie for every Ssid that at least one of the
//! peer's connections is interested in.

use crate::event::{EventKind, SubscriptionEvent};
use crate::message::Message;
use crate::notifier::Notifier;
use crate::ssid::{Channel, Ssid};
use crate::subscriber::{DeliveryError, Subscriber, SubscriberId, SubscriberKind};
use crate::trie::Trie;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Subscription change replicated between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    /// Subscribe or unsubscribe.
    pub kind: EventKind,
    /// Node the change originated on.
    pub node: String,
    /// Connection on the origin node.
    pub connection: SubscriberId,
    /// Subscription Ssid.
    pub ssid: Ssid,
    /// Subscription channel.
    pub channel: Channel,
}

/// Queues local subscription changes for the gossip layer.
#[derive(Debug, Clone)]
pub struct ClusterNotifier {
    node: String,
    sender: mpsc::UnboundedSender<ClusterEvent>,
}

impl ClusterNotifier {
    /// Create a notifier and the queue the gossip layer drains.
    #[must_use]
    pub fn new(node: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                node: node.into(),
                sender,
            },
            receiver,
        )
    }

    fn forward(&self, subscriber: &dyn Subscriber, event: &SubscriptionEvent) {
        // Interest registered on behalf of a peer is already known to that peer.
        if subscriber.kind() != SubscriberKind::Local {
            return;
        }

        let cluster_event = ClusterEvent {
            kind: event.kind,
            node: self.node.clone(),
            connection: event.subscriber.clone(),
            ssid: event.ssid.clone(),
            channel: event.channel.clone(),
        };
        if self.sender.send(cluster_event).is_err() {
            warn!(ssid = %event.ssid, "Cluster queue closed, dropping subscription event");
        }
    }
}

impl Notifier for ClusterNotifier {
    fn notify_subscribe(&self, subscriber: &dyn Subscriber, event: &SubscriptionEvent) {
        self.forward(subscriber, event);
    }

    fn notify_unsubscribe(&self, subscriber: &dyn Subscriber, event: &SubscriptionEvent) {
        self.forward(subscriber, event);
    }
}

/// Proxy subscriber standing for a remote node.
#[derive(Debug)]
pub struct PeerSubscriber {
    id: SubscriberId,
    sender: mpsc::Sender<Arc<Message>>,
}

impl Subscriber for PeerSubscriber {
    fn id(&self) -> &SubscriberId {
        &self.id
    }

    fn kind(&self) -> SubscriberKind {
        SubscriberKind::Remote
    }

    fn send(&self, message: Arc<Message>) -> Result<(), DeliveryError> {
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Interest of one remote node, applied to the local trie.
#[derive(Debug)]
pub struct Peer {
    subscriber: Arc<PeerSubscriber>,
    /// Remote connections interested in each Ssid.
    counters: DashMap<Ssid, usize>,
}

impl Peer {
    /// Create a peer and the receiving end of its forwarding queue.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Arc<Message>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let peer = Self {
            subscriber: Arc::new(PeerSubscriber {
                id: SubscriberId::new(name),
                sender,
            }),
            counters: DashMap::new(),
        };
        (peer, receiver)
    }

    /// Identity of the peer proxy in the trie.
    #[must_use]
    pub fn id(&self) -> &SubscriberId {
        self.subscriber.id()
    }

    /// Apply a replicated event. Returns `true` if the trie changed.
    pub fn apply(&self, trie: &Trie, event: &ClusterEvent) -> bool {
        trace!(peer = %self.id(), kind = ?event.kind, ssid = %event.ssid, "Applying cluster event");
        match event.kind {
            EventKind::Subscribe => {
                let mut count = self.counters.entry(event.ssid.clone()).or_insert(0);
                *count += 1;
                *count == 1 && trie.subscribe(&event.ssid, self.subscriber.clone())
            }
            EventKind::Unsubscribe => {
                let Entry::Occupied(mut entry) = self.counters.entry(event.ssid.clone()) else {
                    debug!(peer = %self.id(), ssid = %event.ssid, "Unsubscribe for unknown interest");
                    return false;
                };
                *entry.get_mut() -= 1;
                if *entry.get() > 0 {
                    return false;
                }
                // Unregister before releasing the counter, so a racing subscribe
                // re-registers after this removal rather than before it.
                let removed = trie.unsubscribe(&event.ssid, self.id());
                entry.remove();
                removed
            }
        }
    }

    /// Remove all interest of this peer, e.g. when it leaves the cluster.
    pub fn leave(&self, trie: &Trie) -> usize {
        self.counters.clear();
        let removed = trie.unsubscribe_all(self.id());
        debug!(peer = %self.id(), removed, "Peer left");
        removed
    }

    /// Number of Ssids this peer is interested in.
    #[must_use]
    pub fn interest_count(&self) -> usize {
        self.counters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::LocalSubscriber;

    fn event(kind: EventKind, connection: &str, channel: &str) -> ClusterEvent {
        let channel = Channel::parse(channel).unwrap();
        ClusterEvent {
            kind,
            node: "node-a".into(),
            connection: connection.into(),
            ssid: Ssid::new(1, &channel),
            channel,
        }
    }

    #[test]
    fn test_notifier_forwards_local_only() {
        let (notifier, mut rx) = ClusterNotifier::new("node-a");
        let (local, _local_rx) = LocalSubscriber::new("conn-1", None, 1);
        let (peer, _peer_rx) = Peer::new("node-b", 1);

        let channel = Channel::parse("a/b").unwrap();
        let ssid = Ssid::new(1, &channel);
        let ev = SubscriptionEvent::new(EventKind::Subscribe, ssid.clone(), channel.clone(), &*local);
        notifier.notify_subscribe(&*local, &ev);

        let peer_ev = SubscriptionEvent::new(EventKind::Subscribe, ssid.clone(), channel, &*peer.subscriber);
        notifier.notify_subscribe(&*peer.subscriber, &peer_ev);

        let forwarded = rx.try_recv().unwrap();
        assert_eq!(forwarded.node, "node-a");
        assert_eq!(forwarded.connection.as_str(), "conn-1");
        assert_eq!(forwarded.ssid, ssid);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_peer_reference_counting() {
        let trie = Trie::new();
        let (peer, _rx) = Peer::new("node-a", 8);

        assert!(peer.apply(&trie, &event(EventKind::Subscribe, "c1", "a/b")));
        assert!(!peer.apply(&trie, &event(EventKind::Subscribe, "c2", "a/b")));
        assert_eq!(trie.count(), 1);

        assert!(!peer.apply(&trie, &event(EventKind::Unsubscribe, "c1", "a/b")));
        assert_eq!(trie.count(), 1);
        assert!(peer.apply(&trie, &event(EventKind::Unsubscribe, "c2", "a/b")));
        assert!(trie.is_empty());

        assert!(!peer.apply(&trie, &event(EventKind::Unsubscribe, "c3", "a/b")));
    }

    #[test]
    fn test_peer_interest_survives_concurrent_churn() {
        let trie = Trie::new();
        let (peer, _rx) = Peer::new("node-a", 8);
        let ssid = Ssid::encode(1, "a/b").unwrap();

        std::thread::scope(|scope| {
            for t in 0..4 {
                let (trie, peer, ssid) = (&trie, &peer, &ssid);
                scope.spawn(move || {
                    let connection = format!("c{}", t);
                    for _ in 0..500 {
                        peer.apply(trie, &event(EventKind::Subscribe, &connection, "a/b"));
                        // While this connection is interested, the proxy stays registered.
                        assert!(trie.lookup(ssid).contains(peer.id()));
                        peer.apply(trie, &event(EventKind::Unsubscribe, &connection, "a/b"));
                    }
                });
            }
        });

        assert_eq!(peer.interest_count(), 0);
        assert!(trie.is_empty());
    }

    #[tokio::test]
    async fn test_peer_receives_matching_messages() {
        let trie = Trie::new();
        let (peer, mut rx) = Peer::new("node-a", 8);
        peer.apply(&trie, &event(EventKind::Subscribe, "c1", "news/+"));

        let channel = Channel::parse("news/sports").unwrap();
        let ssid = Ssid::new(1, &channel);
        let matched = trie.lookup(&ssid);
        assert_eq!(matched.len(), 1);

        let message = Arc::new(Message::new(ssid, channel, b"goal".to_vec()));
        for subscriber in matched.iter() {
            assert_eq!(subscriber.kind(), SubscriberKind::Remote);
            subscriber.send(message.clone()).unwrap();
        }
        assert_eq!(&rx.recv().await.unwrap().payload[..], b"goal");
    }

    #[test]
    fn test_peer_leave() {
        let trie = Trie::new();
        let (peer, _rx) = Peer::new("node-a", 8);
        peer.apply(&trie, &event(EventKind::Subscribe, "c1", "a/b"));
        peer.apply(&trie, &event(EventKind::Subscribe, "c1", "x/#"));

        assert_eq!(peer.interest_count(), 2);
        assert_eq!(peer.leave(&trie), 2);
        assert_eq!(peer.interest_count(), 0);
        assert!(trie.is_empty());
    }

    #[test]
    fn test_cluster_event_serde() {
        let ev = event(EventKind::Subscribe, "c1", "a/b");
        let json = serde_json::to_string(&ev).unwrap();
        let back: ClusterEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }
}
