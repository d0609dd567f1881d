//! Presence tracking for Trellis.
//!
//! Presence is derived from subscription events: every channel keeps a roster of
//! the connections currently subscribed to it, and each change produces a
//! [`Notification`] that the service publishes on the channel's presence Ssid
//! through the ordinary trie lookup.
//!
//! The encoded notification is a compatibility surface for clients:
//!
//! ```json
//! {"req":1,"time":1700000000,"event":"status","channel":"news/sports","who":[{"id":"conn-1","username":"alice"}]}
//! ```

use crate::event::{EventKind, SubscriptionEvent};
use crate::ssid::{Channel, Ssid};
use crate::subscriber::SubscriberId;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

/// Presence event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Full roster snapshot.
    Status,
    /// A connection subscribed.
    Subscribe,
    /// A connection unsubscribed.
    Unsubscribe,
}

impl From<EventKind> for EventType {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Subscribe => EventType::Subscribe,
            EventKind::Unsubscribe => EventType::Unsubscribe,
        }
    }
}

/// Presence information of a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Info {
    /// Subscriber ID.
    pub id: String,
    /// Username of the connection.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
}

impl Info {
    fn from_event(event: &SubscriptionEvent) -> Self {
        Self {
            id: event.subscriber.as_str().to_string(),
            username: event.user.clone().unwrap_or_default(),
        }
    }
}

fn is_zero(req: &u16) -> bool {
    *req == 0
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// A presence notification, built once and encoded once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// ID of the request this answers, 0 for unsolicited notifications.
    #[serde(skip_serializing_if = "is_zero")]
    pub req: u16,
    /// UNIX timestamp in seconds.
    pub time: i64,
    /// Event type.
    pub event: EventType,
    /// Channel the roster belongs to.
    pub channel: String,
    /// One entry for subscribe/unsubscribe, the whole roster for status.
    pub who: Vec<Info>,
    /// Presence Ssid the notification is dispatched on.
    #[serde(skip)]
    pub ssid: Ssid,
}

impl Notification {
    /// Create a notification for a channel.
    #[must_use]
    pub fn new(event: EventType, ssid: &Ssid, channel: &Channel, who: Vec<Info>) -> Self {
        Self {
            req: 0,
            time: unix_seconds(),
            event,
            channel: channel.as_str().to_string(),
            who,
            ssid: ssid.for_presence(),
        }
    }

    /// Tag the notification with the request it answers.
    #[must_use]
    pub fn for_request(mut self, req: u16) -> Self {
        self.req = req;
        self
    }

    /// Encode to JSON.
    ///
    /// Returns `None` and logs if encoding fails; the notification is then dropped.
    #[must_use]
    pub fn encode(&self) -> Option<Bytes> {
        match serde_json::to_vec(self) {
            Ok(encoded) => Some(Bytes::from(encoded)),
            Err(e) => {
                error!(channel = %self.channel, error = %e, "Failed to encode presence notification");
                None
            }
        }
    }
}

/// Members of one channel, ordered by subscriber ID.
#[derive(Debug, Default, Clone)]
pub struct Roster {
    members: BTreeMap<SubscriberId, Info>,
}

impl Roster {
    /// Apply a subscription event and build the notification announcing it.
    ///
    /// Subscribing twice keeps one entry; removing an absent member is a no-op.
    #[must_use]
    pub fn apply(&mut self, event: &SubscriptionEvent) -> Notification {
        let info = Info::from_event(event);
        match event.kind {
            EventKind::Subscribe => {
                if self
                    .members
                    .insert(event.subscriber.clone(), info.clone())
                    .is_none()
                {
                    debug!(channel = %event.channel, connection = %event.subscriber, "Presence: member joined");
                }
            }
            EventKind::Unsubscribe => {
                if self.members.remove(&event.subscriber).is_some() {
                    debug!(channel = %event.channel, connection = %event.subscriber, "Presence: member left");
                }
            }
        }

        Notification::new(event.kind.into(), &event.ssid, &event.channel, vec![info])
    }

    /// Current members.
    #[must_use]
    pub fn members(&self) -> Vec<Info> {
        self.members.values().cloned().collect()
    }

    /// Check whether a subscriber is a member.
    #[must_use]
    pub fn contains(&self, id: &SubscriberId) -> bool {
        self.members.contains_key(id)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if the roster has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Per-channel rosters, keyed by the channel's subscription Ssid.
///
/// Each roster is mutated under its own map entry lock, so changes to one channel
/// are serialized while independent channels proceed in parallel.
#[derive(Debug, Default)]
pub struct Presence {
    rosters: DashMap<Ssid, Roster>,
}

impl Presence {
    /// Create an empty presence tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to a channel's roster.
    ///
    /// Other changes to the same channel wait until `f` returns. A roster left
    /// empty is dropped afterwards. `f` must not call back into this tracker.
    pub fn with_roster<R>(&self, ssid: &Ssid, f: impl FnOnce(&mut Roster) -> R) -> R {
        let mut roster = self.rosters.entry(ssid.clone()).or_default();
        let out = f(&mut roster);
        let empty = roster.is_empty();
        drop(roster);

        if empty {
            self.rosters.remove_if(ssid, |_, roster| roster.is_empty());
        }
        out
    }

    /// Apply a subscription event and build the notification announcing it.
    #[must_use]
    pub fn apply(&self, event: &SubscriptionEvent) -> Notification {
        self.with_roster(&event.ssid, |roster| roster.apply(event))
    }

    /// Build a status notification with the whole roster, without mutating it.
    #[must_use]
    pub fn status(&self, ssid: &Ssid, channel: &Channel) -> Notification {
        Notification::new(EventType::Status, ssid, channel, self.roster(ssid))
    }

    /// Current roster of a channel, ordered by subscriber ID.
    #[must_use]
    pub fn roster(&self, ssid: &Ssid) -> Vec<Info> {
        self.rosters
            .get(ssid)
            .map(|roster| roster.members())
            .unwrap_or_default()
    }

    /// Number of members of a channel.
    #[must_use]
    pub fn count(&self, ssid: &Ssid) -> usize {
        self.rosters.get(ssid).map(|r| r.len()).unwrap_or(0)
    }

    /// Number of channels with at least one member.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.rosters.len()
    }
}
