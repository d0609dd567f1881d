//! Wildcard subscription trie.
//!
//! The trie is sharded by its first two tokens, `(contract, first segment)`,
//! in a [`DashMap`]. Each shard owns a tree of child maps keyed by token and is
//! mutated under that shard's lock, so a lookup always observes a subscriber
//! set either before or after a given registration change.
//!
//! Wildcards are ordinary children keyed by [`SINGLE`] and [`MULTI`]. A lookup
//! explores the exact child, the `+` child and the `#` child at every depth and
//! unions what it finds.

use crate::ssid::{is_reserved, Ssid, Token, MULTI, SINGLE};
use crate::subscriber::{SharedSubscriber, SubscriberId, Subscribers};
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

type ShardKey = (Token, Token);

/// One segment position.
#[derive(Debug, Default)]
struct Node {
    /// Subscribers whose subscription ends here.
    subscribers: Subscribers,
    /// Children by token, wildcards included.
    children: HashMap<Token, Node>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.children.is_empty()
    }

    fn insert(&mut self, path: &[Token], subscriber: SharedSubscriber) -> bool {
        match path.split_first() {
            None => self.subscribers.insert(subscriber),
            Some((token, rest)) => self
                .children
                .entry(*token)
                .or_default()
                .insert(rest, subscriber),
        }
    }

    /// Remove a registration, pruning children left empty on the way back up.
    fn remove(&mut self, path: &[Token], id: &SubscriberId) -> bool {
        let Some((token, rest)) = path.split_first() else {
            return self.subscribers.remove(id);
        };
        let Some(child) = self.children.get_mut(token) else {
            return false;
        };
        let removed = child.remove(rest, id);
        if child.is_empty() {
            self.children.remove(token);
        }
        removed
    }

    fn remove_all(&mut self, id: &SubscriberId) -> usize {
        let mut removed = usize::from(self.subscribers.remove(id));
        self.children.retain(|_, child| {
            removed += child.remove_all(id);
            !child.is_empty()
        });
        removed
    }

    fn collect(&self, path: &[Token], out: &mut Subscribers) {
        // `#` also matches an empty remainder, so it is checked before the end test.
        if let Some(all) = self.children.get(&MULTI) {
            out.extend_from(&all.subscribers);
        }

        let Some((token, rest)) = path.split_first() else {
            out.extend_from(&self.subscribers);
            return;
        };

        if let Some(child) = self.children.get(token) {
            child.collect(rest, out);
        }
        if !is_reserved(*token) {
            if let Some(child) = self.children.get(&SINGLE) {
                child.collect(rest, out);
            }
        }
    }

    fn find(&self, path: &[Token]) -> Option<&Node> {
        match path.split_first() {
            None => Some(self),
            Some((token, rest)) => self.children.get(token)?.find(rest),
        }
    }

    fn count(&self) -> usize {
        self.subscribers.len() + self.children.values().map(Node::count).sum::<usize>()
    }

    fn node_count(&self) -> usize {
        1 + self.children.values().map(Node::node_count).sum::<usize>()
    }
}

fn split(ssid: &Ssid) -> (ShardKey, &[Token]) {
    let tokens = ssid.tokens();
    ((tokens[0], tokens[1]), &tokens[2..])
}

/// Concurrent index from subscription Ssids to subscribers.
#[derive(Debug, Default)]
pub struct Trie {
    shards: DashMap<ShardKey, Node>,
}

impl Trie {
    /// Create an empty trie.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber on an Ssid, which may contain wildcards.
    ///
    /// Returns `false` if the subscriber was already registered there.
    pub fn subscribe(&self, ssid: &Ssid, subscriber: SharedSubscriber) -> bool {
        let (key, path) = split(ssid);
        let id = subscriber.id().clone();
        let added = self.shards.entry(key).or_default().insert(path, subscriber);

        if added {
            debug!(ssid = %ssid, subscriber = %id, "Registered subscription");
        } else {
            trace!(ssid = %ssid, subscriber = %id, "Subscription already registered");
        }
        added
    }

    /// Remove a subscriber from an exact Ssid.
    ///
    /// Returns `false` if no such registration existed.
    pub fn unsubscribe(&self, ssid: &Ssid, id: &SubscriberId) -> bool {
        let (key, path) = split(ssid);
        let removed = match self.shards.get_mut(&key) {
            Some(mut shard) => shard.remove(path, id),
            None => false,
        };

        if removed {
            // Re-checked under the shard lock: a concurrent subscribe keeps it alive.
            self.shards.remove_if(&key, |_, shard| shard.is_empty());
            debug!(ssid = %ssid, subscriber = %id, "Removed subscription");
        }
        removed
    }

    /// Remove every registration of a subscriber. Returns how many were removed.
    pub fn unsubscribe_all(&self, id: &SubscriberId) -> usize {
        let mut removed = 0;
        self.shards.retain(|_, shard| {
            removed += shard.remove_all(id);
            !shard.is_empty()
        });

        if removed > 0 {
            debug!(subscriber = %id, removed, "Removed all subscriptions");
        }
        removed
    }

    /// Find every subscriber whose subscription matches a publish Ssid.
    ///
    /// The result is deduplicated by subscriber identity.
    #[must_use]
    pub fn lookup(&self, ssid: &Ssid) -> Subscribers {
        let mut out = Subscribers::new();
        if ssid.is_wildcard() {
            warn!(ssid = %ssid, "Lookup with a wildcard Ssid");
            return out;
        }

        let ((contract, head), rest) = split(ssid);
        if let Some(shard) = self.shards.get(&(contract, head)) {
            shard.collect(rest, &mut out);
        }

        // Wildcards never reach into a reserved namespace such as presence.
        if !is_reserved(head) {
            if let Some(shard) = self.shards.get(&(contract, SINGLE)) {
                shard.collect(rest, &mut out);
            }
            if let Some(shard) = self.shards.get(&(contract, MULTI)) {
                out.extend_from(&shard.subscribers);
            }
        }

        trace!(ssid = %ssid, matched = out.len(), "Lookup");
        out
    }

    /// Subscribers registered on exactly this Ssid, wildcard tokens compared literally.
    ///
    /// Used to deliver on feeds whose name is itself a pattern, such as the
    /// presence feed of a `news/+` subscription.
    #[must_use]
    pub fn lookup_literal(&self, ssid: &Ssid) -> Subscribers {
        let mut out = Subscribers::new();
        let (key, path) = split(ssid);
        if let Some(shard) = self.shards.get(&key) {
            if let Some(node) = shard.find(path) {
                out.extend_from(&node.subscribers);
            }
        }
        out
    }

    /// Total number of registrations.
    #[must_use]
    pub fn count(&self) -> usize {
        self.shards.iter().map(|shard| shard.count()).sum()
    }

    /// Number of live nodes, shard roots included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.node_count()).sum()
    }

    /// Check if the trie holds no registrations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}
