//! Subscription events raised by the service after a trie mutation.

use crate::ssid::{Channel, Ssid};
use crate::subscriber::{Subscriber, SubscriberId};
use serde::{Deserialize, Serialize};

/// Kind of subscription change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Subscribe,
    Unsubscribe,
}

/// A subscribe or unsubscribe that has been applied to the local trie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEvent {
    /// What happened.
    pub kind: EventKind,
    /// Subscription Ssid.
    pub ssid: Ssid,
    /// Subscription channel.
    pub channel: Channel,
    /// Connection or peer that (un)subscribed.
    pub subscriber: SubscriberId,
    /// Username attached to the connection.
    pub user: Option<String>,
}

impl SubscriptionEvent {
    /// Build an event for a subscriber.
    #[must_use]
    pub fn new(kind: EventKind, ssid: Ssid, channel: Channel, subscriber: &dyn Subscriber) -> Self {
        Self {
            kind,
            ssid,
            channel,
            subscriber: subscriber.id().clone(),
            user: subscriber.username().map(str::to_string),
        }
    }
}
