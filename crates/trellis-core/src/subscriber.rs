//! Subscribers: anything that can receive a matched message.
//!
//! The trie and the service treat every subscriber uniformly through the
//! [`Subscriber`] trait. Local connections use [`LocalSubscriber`]; remote
//! cluster peers are represented by [`PeerSubscriber`](crate::cluster::PeerSubscriber).

use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Unique subscriber identity (connection or peer identifier).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(String);

impl SubscriberId {
    /// Create a new subscriber ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubscriberId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Where a subscriber lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberKind {
    /// A connection attached to this node.
    Local,
    /// A proxy for a remote cluster peer.
    Remote,
}

/// Per-subscriber delivery failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The subscriber's queue is full; the message was dropped for it.
    #[error("Subscriber queue is full")]
    Full,

    /// The subscriber is gone and should be unregistered.
    #[error("Subscriber is closed")]
    Closed,
}

/// A capability able to receive delivered messages.
///
/// `send` must not block: a slow subscriber reports [`DeliveryError::Full`]
/// instead of stalling the publisher.
pub trait Subscriber: Send + Sync + fmt::Debug {
    /// Unique identity of this subscriber.
    fn id(&self) -> &SubscriberId;

    /// Local connection or remote peer.
    fn kind(&self) -> SubscriberKind;

    /// Username attached to the connection, if any.
    fn username(&self) -> Option<&str> {
        None
    }

    /// Hand a message to the subscriber.
    fn send(&self, message: Arc<Message>) -> Result<(), DeliveryError>;
}

/// Shared handle to a subscriber.
pub type SharedSubscriber = Arc<dyn Subscriber>;

/// A set of subscribers keyed by identity.
#[derive(Debug, Clone, Default)]
pub struct Subscribers(HashMap<SubscriberId, SharedSubscriber>);

impl Subscribers {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a subscriber. Returns `true` if it was not present.
    pub fn insert(&mut self, subscriber: SharedSubscriber) -> bool {
        match self.0.entry(subscriber.id().clone()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(subscriber);
                true
            }
        }
    }

    /// Remove a subscriber by identity. Returns `true` if it was present.
    pub fn remove(&mut self, id: &SubscriberId) -> bool {
        self.0.remove(id).is_some()
    }

    /// Check whether a subscriber is present.
    #[must_use]
    pub fn contains(&self, id: &SubscriberId) -> bool {
        self.0.contains_key(id)
    }

    /// Copy every subscriber of `other` into this set.
    pub fn extend_from(&mut self, other: &Subscribers) {
        for (id, subscriber) in &other.0 {
            self.0.entry(id.clone()).or_insert_with(|| subscriber.clone());
        }
    }

    /// Number of subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the subscribers.
    pub fn iter(&self) -> impl Iterator<Item = &SharedSubscriber> {
        self.0.values()
    }

    /// Sorted subscriber identities.
    #[must_use]
    pub fn ids(&self) -> Vec<SubscriberId> {
        let mut ids: Vec<_> = self.0.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// A subscriber backed by a connection's bounded outbound queue.
#[derive(Debug)]
pub struct LocalSubscriber {
    id: SubscriberId,
    username: Option<String>,
    sender: mpsc::Sender<Arc<Message>>,
}

impl LocalSubscriber {
    /// Create a subscriber and the receiving end of its queue.
    #[must_use]
    pub fn new(
        id: impl Into<SubscriberId>,
        username: Option<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<Message>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let subscriber = Arc::new(Self {
            id: id.into(),
            username,
            sender,
        });
        (subscriber, receiver)
    }
}

impl Subscriber for LocalSubscriber {
    fn id(&self) -> &SubscriberId {
        &self.id
    }

    fn kind(&self) -> SubscriberKind {
        SubscriberKind::Local
    }

    fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    fn send(&self, message: Arc<Message>) -> Result<(), DeliveryError> {
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })?;
        trace!(subscriber = %self.id, "Queued message");
        Ok(())
    }
}
