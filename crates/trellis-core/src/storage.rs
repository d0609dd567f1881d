//! Message retention boundary.
//!
//! The service hands retained messages to a [`Storage`] without waiting for the
//! result and asks it for recent messages when a subscriber requests a replay.

use crate::message::{now_millis, Message};
use crate::ssid::Ssid;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend cannot be reached or refused the operation.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Retained message store.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Retain a message until its TTL runs out.
    async fn store(&self, message: Arc<Message>) -> Result<(), StorageError>;

    /// Return up to `limit` most recent live messages matching a subscription
    /// Ssid, oldest first.
    async fn query_last(&self, ssid: &Ssid, limit: usize)
        -> Result<Vec<Arc<Message>>, StorageError>;
}

/// Storage that retains nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorage;

#[async_trait]
impl Storage for NoopStorage {
    async fn store(&self, _: Arc<Message>) -> Result<(), StorageError> {
        Ok(())
    }

    async fn query_last(&self, _: &Ssid, _: usize) -> Result<Vec<Arc<Message>>, StorageError> {
        Ok(Vec::new())
    }
}

/// In-memory storage keeping the latest messages of every Ssid.
#[derive(Debug)]
pub struct MemoryStorage {
    messages: DashMap<Ssid, VecDeque<Arc<Message>>>,
    capacity: usize,
}

impl MemoryStorage {
    /// Create a store retaining up to `capacity` messages per Ssid.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Drop expired messages, and the queues they leave empty.
    ///
    /// Returns the number of messages removed.
    pub fn purge_expired(&self) -> usize {
        let now = now_millis();
        let mut purged = 0;
        self.messages.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|m| !m.is_expired(now));
            purged += before - queue.len();
            !queue.is_empty()
        });

        if purged > 0 {
            debug!(purged, "Purged expired messages");
        }
        purged
    }

    /// Number of retained messages, expired ones included until the next purge.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.iter().map(|m| m.len()).sum()
    }

    /// Number of Ssids with retained messages.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.messages.len()
    }

    /// Check if nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, message: Arc<Message>) -> Result<(), StorageError> {
        let now = now_millis();
        let mut queue = self.messages.entry(message.ssid.clone()).or_default();
        queue.retain(|m| !m.is_expired(now));
        if queue.len() == self.capacity {
            queue.pop_front();
        }
        trace!(ssid = %message.ssid, "Retained message");
        queue.push_back(message);
        Ok(())
    }

    async fn query_last(
        &self,
        ssid: &Ssid,
        limit: usize,
    ) -> Result<Vec<Arc<Message>>, StorageError> {
        self.purge_expired();

        let now = now_millis();
        let mut found: Vec<Arc<Message>> = self
            .messages
            .iter()
            .filter(|entry| ssid.matches(entry.key()))
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|m| !m.is_expired(now))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();

        found.sort_by_key(|m| (m.timestamp, m.id));
        let skip = found.len().saturating_sub(limit);
        Ok(found.split_off(skip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssid::Channel;
    use std::time::Duration;

    fn retained(channel: &str, payload: &str) -> Arc<Message> {
        let channel = Channel::parse(channel).unwrap();
        Arc::new(
            Message::new(Ssid::new(1, &channel), channel, payload.as_bytes().to_vec())
                .with_ttl(Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn test_noop_storage() {
        let storage = NoopStorage;
        storage.store(retained("a", "x")).await.unwrap();
        let ssid = Ssid::encode(1, "a").unwrap();
        assert!(storage.query_last(&ssid, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_storage_capacity() {
        let storage = MemoryStorage::new(2);
        for payload in ["1", "2", "3"] {
            storage.store(retained("a/b", payload)).await.unwrap();
        }
        assert_eq!(storage.len(), 2);

        let ssid = Ssid::encode(1, "a/b").unwrap();
        let last = storage.query_last(&ssid, 10).await.unwrap();
        let payloads: Vec<_> = last.iter().map(|m| m.payload.to_vec()).collect();
        assert_eq!(payloads, vec![b"2".to_vec(), b"3".to_vec()]);
    }

    #[tokio::test]
    async fn test_memory_storage_purges_expired() {
        let storage = MemoryStorage::default();
        for channel in ["old/a", "old/b"] {
            let mut message = (*retained(channel, "stale")).clone();
            message.timestamp -= 120_000;
            storage.store(Arc::new(message)).await.unwrap();
        }
        storage.store(retained("fresh", "x")).await.unwrap();
        assert_eq!(storage.channel_count(), 3);

        let pattern = Ssid::encode(1, "old/+").unwrap();
        assert!(storage.query_last(&pattern, 10).await.unwrap().is_empty());
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.channel_count(), 1);
        assert_eq!(storage.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_memory_storage_wildcard_query() {
        let storage = MemoryStorage::default();
        storage.store(retained("news/sports", "goal")).await.unwrap();
        storage.store(retained("news/weather", "rain")).await.unwrap();
        storage.store(retained("other", "x")).await.unwrap();

        let pattern = Ssid::encode(1, "news/+").unwrap();
        assert_eq!(storage.query_last(&pattern, 10).await.unwrap().len(), 2);
        assert_eq!(storage.query_last(&pattern, 1).await.unwrap().len(), 1);
        assert!(storage.query_last(&pattern, 0).await.unwrap().is_empty());
    }
}
