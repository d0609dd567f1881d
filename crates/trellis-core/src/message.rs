//! Message types for Trellis.
//!
//! A [`Message`] is built once per publish and shared between every matched
//! subscriber behind an `Arc`.

use crate::ssid::{Channel, Ssid};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the UNIX epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    timestamp.wrapping_add(ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// A published message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Ssid the message was published on.
    pub ssid: Ssid,
    /// Channel the message was published on.
    pub channel: Channel,
    /// Message payload.
    pub payload: Bytes,
    /// Retention time requested by the publisher, if any.
    pub ttl: Option<Duration>,
    /// Creation time in milliseconds since the UNIX epoch.
    pub timestamp: u64,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(ssid: Ssid, channel: Channel, payload: impl Into<Bytes>) -> Self {
        Self {
            id: generate_message_id(),
            ssid,
            channel,
            payload: payload.into(),
            ttl: None,
            timestamp: now_millis(),
        }
    }

    /// Request retention for the given duration.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Check whether the message should go to storage.
    #[must_use]
    pub fn is_retained(&self) -> bool {
        self.ttl.is_some_and(|ttl| !ttl.is_zero())
    }

    /// Check whether a retained message has outlived its TTL.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.ttl {
            Some(ttl) => now_ms.saturating_sub(self.timestamp) > ttl.as_millis() as u64,
            None => false,
        }
    }
}
