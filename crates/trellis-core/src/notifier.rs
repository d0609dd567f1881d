//! Cluster notification boundary.
//!
//! The service calls the notifier synchronously, right after the local trie has
//! been mutated. Implementations must return quickly and never wait on peers.

use crate::event::SubscriptionEvent;
use crate::subscriber::Subscriber;

/// Propagates subscription changes to the rest of the cluster.
pub trait Notifier: Send + Sync {
    /// A subscription was registered locally.
    fn notify_subscribe(&self, subscriber: &dyn Subscriber, event: &SubscriptionEvent);

    /// A subscription was removed locally.
    fn notify_unsubscribe(&self, subscriber: &dyn Subscriber, event: &SubscriptionEvent);
}

/// Notifier for a standalone node.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify_subscribe(&self, _: &dyn Subscriber, _: &SubscriptionEvent) {}

    fn notify_unsubscribe(&self, _: &dyn Subscriber, _: &SubscriptionEvent) {}
}
