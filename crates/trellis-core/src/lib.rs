//! # trellis-core
//!
//! Matching and dispatch core of the Trellis pub/sub broker.
//!
//! - **Ssid** - Channel validation and the hashed subscription identifier
//! - **Trie** - Concurrent wildcard subscription index
//! - **Service** - Subscribe, unsubscribe, publish and request dispatch
//! - **Presence** - Per-channel rosters and presence notifications
//! - **Cluster** - Notifier boundary and peer interest tracking
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Service   │────▶│    Trie     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │       │
//!                        ▼       ▼
//!               ┌──────────┐ ┌──────────┐
//!               │ Notifier │ │ Presence │
//!               └──────────┘ └──────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use trellis_core::{
//!     AllowAll, LocalSubscriber, NoopNotifier, NoopStorage, Service, SharedSubscriber,
//!     SubscribeOptions, Trie,
//! };
//!
//! let service = Service::new(
//!     Arc::new(AllowAll::default()),
//!     Arc::new(NoopStorage),
//!     Arc::new(NoopNotifier),
//!     Arc::new(Trie::new()),
//!     Vec::new(),
//! );
//!
//! let (conn, mut rx) = LocalSubscriber::new("conn-1", None, 16);
//! let conn: SharedSubscriber = conn;
//! service
//!     .subscribe(&conn, "key", "news/+", SubscribeOptions::default())
//!     .unwrap();
//!
//! let report = service.publish("key", "news/sports", "goal", None).unwrap();
//! assert_eq!(report.delivered, 1);
//! assert_eq!(&rx.try_recv().unwrap().payload[..], b"goal");
//! ```

pub mod auth;
pub mod cluster;
pub mod event;
pub mod handler;
pub mod message;
pub mod notifier;
pub mod presence;
pub mod service;
pub mod ssid;
pub mod storage;
pub mod subscriber;
pub mod trie;

pub use auth::{Action, AllowAll, Authorizer, Denied, Grant, KeyRule, StaticKeys};
pub use cluster::{ClusterEvent, ClusterNotifier, Peer, PeerSubscriber};
pub use event::{EventKind, SubscriptionEvent};
pub use handler::{Handler, PresenceHandler, PresenceRequest, Request, REQUEST_PRESENCE};
pub use message::Message;
pub use notifier::{NoopNotifier, Notifier};
pub use presence::{EventType, Info, Notification, Presence, Roster};
pub use service::{
    PublishReport, Service, ServiceConfig, ServiceError, SubscribeOptions, Subscription,
};
pub use ssid::{Channel, ChannelError, Ssid, Token};
pub use storage::{MemoryStorage, NoopStorage, Storage, StorageError};
pub use subscriber::{
    DeliveryError, LocalSubscriber, SharedSubscriber, Subscriber, SubscriberId, SubscriberKind,
};
pub use trie::Trie;
