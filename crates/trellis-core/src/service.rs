//! The pub/sub service.
//!
//! [`Service`] is the single entry point through which connections and protocol
//! handlers reach the matching core. Every subscription change goes through the
//! same sequence:
//!
//! 1. authorize the request,
//! 2. mutate the trie,
//! 3. notify the cluster,
//! 4. update presence and publish the resulting notification.
//!
//! Steps 2 to 4 run under the channel's roster lock, so concurrent changes to one
//! channel leave the trie, the cluster and the roster in the same order. The
//! presence notification is published after the lock is released and never
//! raises a subscription event itself. Subscribers found closed during a fan-out
//! are disconnected only after it completes.

use crate::auth::{Action, Authorizer, Denied, Grant};
use crate::event::{EventKind, SubscriptionEvent};
use crate::handler::{Handler, PresenceHandler, Request};
use crate::message::Message;
use crate::notifier::Notifier;
use crate::presence::{Notification, Presence, Roster};
use crate::ssid::{Channel, ChannelError, Ssid};
use crate::storage::Storage;
use crate::subscriber::{
    DeliveryError, SharedSubscriber, Subscriber, SubscriberId, SubscriberKind, Subscribers,
};
use crate::trie::Trie;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Service errors, reported to the caller of the failed operation.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed channel or wildcard placement.
    #[error("Invalid channel: {0}")]
    InvalidChannel(#[from] ChannelError),

    /// The authorizer refused the operation.
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] Denied),

    /// No handler is registered for the request type.
    #[error("Unknown request type: {0}")]
    UnknownRequestType(u32),

    /// Publishing requires a concrete channel.
    #[error("Cannot publish to wildcard channel: {0}")]
    WildcardPublish(Channel),

    /// The connection already holds the maximum number of subscriptions.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// The request body could not be understood.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A response could not be encoded.
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl ServiceError {
    /// Status code reported to clients.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidChannel(_) | Self::WildcardPublish(_) | Self::BadRequest(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::UnknownRequestType(_) => 404,
            Self::MaxSubscriptionsReached => 429,
            Self::Encoding(_) => 500,
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
    /// Whether subscription changes produce presence notifications.
    pub presence: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: 100,
            presence: true,
        }
    }
}

/// Options of a subscribe request.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Return the presence roster right away.
    pub status: bool,
    /// Replay up to this many retained messages to the new subscriber.
    pub last: usize,
    /// Request ID, echoed in the status notification.
    pub request: u16,
}

/// Result of a subscribe request.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Encoded subscription.
    pub ssid: Ssid,
    /// Normalized channel.
    pub channel: Channel,
    /// `false` if the subscriber was already registered.
    pub created: bool,
    /// Presence roster, if requested.
    pub status: Option<Notification>,
}

/// Outcome of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers matched by the lookup.
    pub matched: usize,
    /// Subscribers that accepted the message.
    pub delivered: usize,
    /// Subscribers that were full or closed.
    pub dropped: usize,
}

/// The pub/sub service.
pub struct Service {
    auth: Arc<dyn Authorizer>,
    store: Arc<dyn Storage>,
    notifier: Arc<dyn Notifier>,
    trie: Arc<Trie>,
    presence: Presence,
    handlers: HashMap<u32, Arc<dyn Handler>>,
    /// Channel subscriptions of each subscriber (subscriber -> ssid -> channel).
    subscriptions: DashMap<SubscriberId, HashMap<Ssid, Channel>>,
    /// Presence feeds followed by each subscriber.
    watches: DashMap<SubscriberId, HashSet<Ssid>>,
    config: ServiceConfig,
}

impl Service {
    /// Create a service with default configuration.
    #[must_use]
    pub fn new(
        auth: Arc<dyn Authorizer>,
        store: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
        trie: Arc<Trie>,
        handlers: Vec<Arc<dyn Handler>>,
    ) -> Self {
        Self::with_config(auth, store, notifier, trie, handlers, ServiceConfig::default())
    }

    /// Create a service with custom configuration.
    ///
    /// The presence handler is registered unless `handlers` already serves its
    /// request type. When two handlers share a type, the first one wins.
    #[must_use]
    pub fn with_config(
        auth: Arc<dyn Authorizer>,
        store: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
        trie: Arc<Trie>,
        handlers: Vec<Arc<dyn Handler>>,
        config: ServiceConfig,
    ) -> Self {
        let builtin: Arc<dyn Handler> = Arc::new(PresenceHandler);
        let mut table: HashMap<u32, Arc<dyn Handler>> = HashMap::with_capacity(handlers.len() + 1);
        for handler in handlers.into_iter().chain(std::iter::once(builtin)) {
            match table.entry(handler.kind()) {
                Entry::Occupied(_) => warn!(kind = handler.kind(), "Duplicate handler ignored"),
                Entry::Vacant(slot) => {
                    slot.insert(handler);
                }
            }
        }

        info!("Creating service with config: {:?}", config);
        Self {
            auth,
            store,
            notifier,
            trie,
            presence: Presence::new(),
            handlers: table,
            subscriptions: DashMap::new(),
            watches: DashMap::new(),
            config,
        }
    }

    /// The subscription trie.
    #[must_use]
    pub fn trie(&self) -> &Arc<Trie> {
        &self.trie
    }

    /// The presence rosters.
    #[must_use]
    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// The service configuration.
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Number of channel subscriptions held by a subscriber.
    #[must_use]
    pub fn subscription_count(&self, id: &SubscriberId) -> usize {
        self.subscriptions.get(id).map(|s| s.len()).unwrap_or(0)
    }

    fn authorize(&self, key: &str, channel: &Channel, action: Action) -> Result<Grant, ServiceError> {
        self.auth.authorize(key, channel, action).map_err(|denied| {
            warn!(channel = %channel, ?action, reason = %denied, "Unauthorized");
            ServiceError::Unauthorized(denied)
        })
    }

    /// Subscribe a connection to a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is invalid, the key is not authorized, or
    /// the subscription limit is reached. Nothing is changed in that case.
    pub fn subscribe(
        &self,
        subscriber: &SharedSubscriber,
        key: &str,
        channel: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription, ServiceError> {
        let channel = Channel::parse(channel)?;
        let grant = self.authorize(key, &channel, Action::Subscribe)?;
        if options.last > 0 {
            self.authorize(key, &channel, Action::Load)?;
        }
        let ssid = Ssid::new(grant.contract, &channel);

        let id = subscriber.id();
        let (created, presence) = self.presence.with_roster(&ssid, |roster| -> Result<_, ServiceError> {
            if !self.register(subscriber, &ssid, &channel)? {
                return Ok((false, None));
            }
            let event = SubscriptionEvent::new(
                EventKind::Subscribe,
                ssid.clone(),
                channel.clone(),
                &**subscriber,
            );
            Ok((true, self.raise(&**subscriber, &event, roster)))
        })?;

        let mut closed = Vec::new();
        if let Some(message) = presence {
            self.publish_presence(&message, &mut closed);
        }
        self.reap(closed);

        if options.last > 0 {
            self.replay(subscriber.clone(), ssid.clone(), options.last);
        }

        let status = options
            .status
            .then(|| self.presence.status(&ssid, &channel).for_request(options.request));

        debug!(channel = %channel, connection = %id, created, "Subscribed");
        Ok(Subscription {
            ssid,
            channel,
            created,
            status,
        })
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// Returns `false` if the connection was not subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is invalid or the key is not authorized.
    pub fn unsubscribe(
        &self,
        subscriber: &SharedSubscriber,
        key: &str,
        channel: &str,
    ) -> Result<bool, ServiceError> {
        let channel = Channel::parse(channel)?;
        let grant = self.authorize(key, &channel, Action::Subscribe)?;
        let ssid = Ssid::new(grant.contract, &channel);
        let id = subscriber.id();

        let (removed, presence) = self.presence.with_roster(&ssid, |roster| {
            if !self.deregister(id, &ssid) {
                return (false, None);
            }
            let event =
                SubscriptionEvent::new(EventKind::Unsubscribe, ssid.clone(), channel, &**subscriber);
            (true, self.raise(&**subscriber, &event, roster))
        });

        let mut closed = Vec::new();
        if let Some(message) = presence {
            self.publish_presence(&message, &mut closed);
        }
        self.reap(closed);

        debug!(connection = %id, removed, "Unsubscribed");
        Ok(removed)
    }

    /// Publish a message to every matching subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is invalid or a wildcard, or if the key
    /// may not publish (or store, when a TTL is given). Individual delivery
    /// failures never fail the publish; they are counted in the report.
    pub fn publish(
        &self,
        key: &str,
        channel: &str,
        payload: impl Into<Bytes>,
        ttl: Option<Duration>,
    ) -> Result<PublishReport, ServiceError> {
        let channel = Channel::parse(channel)?;
        if channel.is_wildcard() {
            return Err(ServiceError::WildcardPublish(channel));
        }
        let grant = self.authorize(key, &channel, Action::Publish)?;

        let mut message = Message::new(Ssid::new(grant.contract, &channel), channel, payload);
        if let Some(ttl) = ttl {
            message = message.with_ttl(ttl);
        }
        if message.is_retained() {
            self.authorize(key, &message.channel, Action::Store)?;
        }

        let message = Arc::new(message);
        if message.is_retained() {
            self.retain(message.clone());
        }
        Ok(self.dispatch(message))
    }

    /// Start or stop following presence changes of a channel.
    ///
    /// The subscription lives on the presence Ssid and raises no subscription
    /// event. Returns whether the trie changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is invalid or presence is not authorized.
    pub fn watch_presence(
        &self,
        subscriber: &SharedSubscriber,
        key: &str,
        channel: &str,
        follow: bool,
    ) -> Result<bool, ServiceError> {
        let channel = Channel::parse(channel)?;
        let grant = self.authorize(key, &channel, Action::Presence)?;
        let ssid = Ssid::presence(grant.contract, &channel);

        let id = subscriber.id();
        if follow {
            let mut watched = self.watches.entry(id.clone()).or_default();
            let added = self.trie.subscribe(&ssid, subscriber.clone());
            watched.insert(ssid);
            return Ok(added);
        }

        let removed = match self.watches.get_mut(id) {
            Some(mut watched) => {
                watched.remove(&ssid);
                self.trie.unsubscribe(&ssid, id)
            }
            None => self.trie.unsubscribe(&ssid, id),
        };
        self.watches.remove_if(id, |_, watched| watched.is_empty());
        Ok(removed)
    }

    /// Current presence roster of a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is invalid or presence is not authorized.
    pub fn presence_status(
        &self,
        key: &str,
        channel: &str,
        request: u16,
    ) -> Result<Notification, ServiceError> {
        let channel = Channel::parse(channel)?;
        let grant = self.authorize(key, &channel, Action::Presence)?;
        let ssid = Ssid::new(grant.contract, &channel);
        Ok(self.presence.status(&ssid, &channel).for_request(request))
    }

    /// Route a request to the handler registered for its type.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::UnknownRequestType`] if no handler serves `kind`,
    /// or whatever the handler reports.
    pub async fn handle(&self, kind: u32, request: Request) -> Result<Bytes, ServiceError> {
        let Some(handler) = self.handlers.get(&kind) else {
            warn!(kind, connection = %request.subscriber.id(), "Unknown request type");
            return Err(ServiceError::UnknownRequestType(kind));
        };
        handler.handle(self, request).await
    }

    /// Remove every registration of a subscriber, e.g. when its connection closes.
    ///
    /// Each channel subscription raises an unsubscribe event, so presence sees
    /// the connection leave. Returns the number of registrations removed.
    pub fn disconnect(&self, subscriber: &dyn Subscriber) -> usize {
        let mut closed = Vec::new();
        let removed = self.detach(subscriber, &mut closed);
        self.reap(closed);
        removed
    }

    /// Reserve a slot for `ssid` and register the subscriber in the trie.
    ///
    /// The connection's bookkeeping stays locked across the trie mutation, so
    /// concurrent subscribes of one connection cannot overshoot the limit.
    fn register(
        &self,
        subscriber: &SharedSubscriber,
        ssid: &Ssid,
        channel: &Channel,
    ) -> Result<bool, ServiceError> {
        let id = subscriber.id();
        let mut held = self.subscriptions.entry(id.clone()).or_default();
        if !held.contains_key(ssid) && held.len() >= self.config.max_subscriptions_per_connection {
            drop(held);
            self.subscriptions.remove_if(id, |_, held| held.is_empty());
            return Err(ServiceError::MaxSubscriptionsReached);
        }

        let created = self.trie.subscribe(ssid, subscriber.clone());
        if created {
            held.insert(ssid.clone(), channel.clone());
        }
        Ok(created)
    }

    fn deregister(&self, id: &SubscriberId, ssid: &Ssid) -> bool {
        let removed = match self.subscriptions.get_mut(id) {
            Some(mut held) => {
                held.remove(ssid);
                self.trie.unsubscribe(ssid, id)
            }
            None => self.trie.unsubscribe(ssid, id),
        };
        self.subscriptions.remove_if(id, |_, held| held.is_empty());
        removed
    }

    /// Remove all registrations of one subscriber. Subscribers found closed
    /// while announcing its departure are pushed to `closed`.
    fn detach(&self, subscriber: &dyn Subscriber, closed: &mut Vec<SharedSubscriber>) -> usize {
        let id = subscriber.id();

        // Presence feeds first, so the connection hears nothing about itself.
        let watched = self.watches.remove(id).map(|(_, w)| w).unwrap_or_default();
        let mut removed = watched
            .iter()
            .filter(|ssid| self.trie.unsubscribe(ssid, id))
            .count();
        // Peer proxies are registered on the trie directly.
        if subscriber.kind() == SubscriberKind::Remote {
            removed += self.trie.unsubscribe_all(id);
        }

        let held = self
            .subscriptions
            .remove(id)
            .map(|(_, held)| held)
            .unwrap_or_default();
        for (ssid, channel) in held {
            let change = self.presence.with_roster(&ssid, |roster| {
                if !self.trie.unsubscribe(&ssid, id) {
                    return None;
                }
                let event =
                    SubscriptionEvent::new(EventKind::Unsubscribe, ssid.clone(), channel, subscriber);
                Some(self.raise(subscriber, &event, roster))
            });
            let Some(presence) = change else {
                continue;
            };
            removed += 1;
            if let Some(message) = presence {
                self.publish_presence(&message, closed);
            }
        }

        debug!(connection = %id, removed, "Disconnected");
        removed
    }

    /// Disconnect closed subscribers, including any found closed along the way.
    fn reap(&self, mut closed: Vec<SharedSubscriber>) {
        while let Some(subscriber) = closed.pop() {
            debug!(subscriber = %subscriber.id(), "Removing closed subscriber");
            self.detach(&*subscriber, &mut closed);
        }
    }

    /// Fan a message out to every matching subscriber.
    ///
    /// Subscribers found closed are disconnected once the fan-out is done.
    fn dispatch(&self, message: Arc<Message>) -> PublishReport {
        let subscribers = self.trie.lookup(&message.ssid);
        let mut closed = Vec::new();
        let report = self.deliver(&message, &subscribers, &mut closed);
        self.reap(closed);
        report
    }

    fn deliver(
        &self,
        message: &Arc<Message>,
        subscribers: &Subscribers,
        closed: &mut Vec<SharedSubscriber>,
    ) -> PublishReport {
        let mut report = PublishReport {
            matched: subscribers.len(),
            ..PublishReport::default()
        };

        for subscriber in subscribers.iter() {
            match subscriber.send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::Full) => {
                    report.dropped += 1;
                    warn!(channel = %message.channel, subscriber = %subscriber.id(), "Subscriber queue full, message dropped");
                }
                Err(DeliveryError::Closed) => {
                    report.dropped += 1;
                    closed.push(subscriber.clone());
                }
            }
        }

        trace!(channel = %message.channel, matched = report.matched, delivered = report.delivered, "Dispatched");
        report
    }

    /// Notify the cluster of a subscription change and apply it to the roster.
    ///
    /// Runs under the channel's roster lock. Returns the presence message to
    /// publish once the lock is released.
    fn raise(
        &self,
        subscriber: &dyn Subscriber,
        event: &SubscriptionEvent,
        roster: &mut Roster,
    ) -> Option<Arc<Message>> {
        match event.kind {
            EventKind::Subscribe => self.notifier.notify_subscribe(subscriber, event),
            EventKind::Unsubscribe => self.notifier.notify_unsubscribe(subscriber, event),
        }

        if !self.config.presence || event.ssid.is_presence() {
            return None;
        }
        let notification = roster.apply(event);
        let payload = notification.encode()?;
        Some(Arc::new(Message::new(
            notification.ssid,
            event.channel.clone(),
            payload,
        )))
    }

    /// Publish a presence message on its feed.
    ///
    /// Feeds of wildcard subscriptions are named by the pattern itself and reach
    /// only watchers of that exact pattern. Closed watchers are left in `closed`.
    fn publish_presence(&self, message: &Arc<Message>, closed: &mut Vec<SharedSubscriber>) {
        let subscribers = if message.ssid.is_wildcard() {
            self.trie.lookup_literal(&message.ssid)
        } else {
            self.trie.lookup(&message.ssid)
        };
        let report = self.deliver(message, &subscribers, closed);
        trace!(channel = %message.channel, delivered = report.delivered, "Published presence");
    }

    fn retain(&self, message: Arc<Message>) {
        let store = self.store.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = store.store(message).await {
                        warn!(error = %e, "Failed to store message");
                    }
                });
            }
            Err(_) => warn!(channel = %message.channel, "No runtime available, message not stored"),
        }
    }

    fn replay(&self, subscriber: SharedSubscriber, ssid: Ssid, last: usize) {
        let store = self.store.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match store.query_last(&ssid, last).await {
                        Ok(messages) => {
                            for message in messages {
                                if subscriber.send(message).is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => warn!(ssid = %ssid, error = %e, "Failed to load retained messages"),
                    }
                });
            }
            Err(_) => warn!(ssid = %ssid, "No runtime available, retained messages not loaded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, KeyRule, StaticKeys};
    use crate::notifier::NoopNotifier;
    use crate::storage::{MemoryStorage, NoopStorage};
    use crate::subscriber::LocalSubscriber;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn service() -> Service {
        Service::new(
            Arc::new(AllowAll::default()),
            Arc::new(NoopStorage),
            Arc::new(NoopNotifier),
            Arc::new(Trie::new()),
            Vec::new(),
        )
    }

    fn connection(id: &str) -> (SharedSubscriber, mpsc::Receiver<Arc<Message>>) {
        let (sub, rx) = LocalSubscriber::new(id, None, 16);
        (sub as SharedSubscriber, rx)
    }

    /// Records events and checks the trie was mutated before the notification.
    struct RecordingNotifier {
        trie: Arc<Trie>,
        events: Mutex<Vec<(EventKind, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify_subscribe(&self, subscriber: &dyn Subscriber, event: &SubscriptionEvent) {
            assert!(self.trie.lookup(&event.ssid).contains(subscriber.id()));
            self.events
                .lock()
                .unwrap()
                .push((event.kind, event.channel.to_string()));
        }

        fn notify_unsubscribe(&self, subscriber: &dyn Subscriber, event: &SubscriptionEvent) {
            assert!(!self.trie.lookup(&event.ssid).contains(subscriber.id()));
            self.events
                .lock()
                .unwrap()
                .push((event.kind, event.channel.to_string()));
        }
    }

    #[test]
    fn test_subscribe_publish_unsubscribe() {
        let service = service();
        let (conn, mut rx) = connection("conn-1");

        let sub = service
            .subscribe(&conn, "k", "news/sports", SubscribeOptions::default())
            .unwrap();
        assert!(sub.created);
        assert!(sub.status.is_none());
        assert_eq!(service.subscription_count(conn.id()), 1);

        let report = service.publish("k", "news/sports", b"goal".to_vec(), None).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(&rx.try_recv().unwrap().payload[..], b"goal");

        assert!(service.unsubscribe(&conn, "k", "news/sports").unwrap());
        assert!(!service.unsubscribe(&conn, "k", "news/sports").unwrap());
        assert_eq!(service.subscription_count(conn.id()), 0);

        let report = service.publish("k", "news/sports", b"late".to_vec(), None).unwrap();
        assert_eq!(report.matched, 0);
    }

    #[test]
    fn test_notifier_runs_after_mutation() {
        let trie = Arc::new(Trie::new());
        let notifier = Arc::new(RecordingNotifier {
            trie: trie.clone(),
            events: Mutex::new(Vec::new()),
        });
        let service = Service::new(
            Arc::new(AllowAll::default()),
            Arc::new(NoopStorage),
            notifier.clone(),
            trie,
            Vec::new(),
        );
        let (conn, _rx) = connection("conn-1");

        service
            .subscribe(&conn, "k", "a/b", SubscribeOptions::default())
            .unwrap();
        // Second subscribe is a no-op and raises nothing.
        service
            .subscribe(&conn, "k", "a/b", SubscribeOptions::default())
            .unwrap();
        service.unsubscribe(&conn, "k", "a/b").unwrap();

        let events = notifier.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                (EventKind::Subscribe, "a/b".to_string()),
                (EventKind::Unsubscribe, "a/b".to_string())
            ]
        );
    }

    #[test]
    fn test_invalid_and_unauthorized_requests_change_nothing() {
        let keys = StaticKeys::new([KeyRule {
            key: "reader".into(),
            contract: 1,
            channel: Channel::parse("news/#").unwrap(),
            permissions: vec![Action::Subscribe],
        }]);
        let service = Service::new(
            Arc::new(keys),
            Arc::new(NoopStorage),
            Arc::new(NoopNotifier),
            Arc::new(Trie::new()),
            Vec::new(),
        );
        let (conn, _rx) = connection("conn-1");

        assert!(matches!(
            service.subscribe(&conn, "reader", "news//x", SubscribeOptions::default()),
            Err(ServiceError::InvalidChannel(_))
        ));
        assert!(matches!(
            service.subscribe(&conn, "reader", "weather", SubscribeOptions::default()),
            Err(ServiceError::Unauthorized(_))
        ));
        assert!(matches!(
            service.subscribe(
                &conn,
                "reader",
                "news/sports",
                SubscribeOptions {
                    last: 5,
                    ..SubscribeOptions::default()
                }
            ),
            Err(ServiceError::Unauthorized(_))
        ));
        assert!(matches!(
            service.publish("reader", "news/sports", b"x".to_vec(), None),
            Err(ServiceError::Unauthorized(_))
        ));

        assert!(service.trie().is_empty());
        assert_eq!(service.presence().channel_count(), 0);
    }

    #[test]
    fn test_wildcard_publish_rejected() {
        let service = service();
        let err = service
            .publish("k", "news/+", b"x".to_vec(), None)
            .unwrap_err();
        assert!(matches!(err, ServiceError::WildcardPublish(_)));
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_max_subscriptions() {
        let service = Service::with_config(
            Arc::new(AllowAll::default()),
            Arc::new(NoopStorage),
            Arc::new(NoopNotifier),
            Arc::new(Trie::new()),
            Vec::new(),
            ServiceConfig {
                max_subscriptions_per_connection: 2,
                presence: true,
            },
        );
        let (conn, _rx) = connection("conn-1");
        let opts = SubscribeOptions::default();

        service.subscribe(&conn, "k", "a", opts).unwrap();
        service.subscribe(&conn, "k", "b", opts).unwrap();
        // Re-subscribing to a held channel is still fine.
        assert!(!service.subscribe(&conn, "k", "a", opts).unwrap().created);
        assert!(matches!(
            service.subscribe(&conn, "k", "c", opts),
            Err(ServiceError::MaxSubscriptionsReached)
        ));
    }

    #[test]
    fn test_status_on_subscribe() {
        let service = service();
        let (conn, _rx) = connection("conn-1");

        let sub = service
            .subscribe(
                &conn,
                "k",
                "news/sports",
                SubscribeOptions {
                    status: true,
                    request: 9,
                    ..SubscribeOptions::default()
                },
            )
            .unwrap();

        let status = sub.status.unwrap();
        assert_eq!(status.req, 9);
        assert_eq!(status.who.len(), 1);
        assert_eq!(status.who[0].id, "conn-1");
    }

    #[test]
    fn test_presence_changes_are_published() {
        let service = service();
        let (watcher, mut watcher_rx) = connection("watcher");
        let (conn, _rx) = connection("conn-1");

        assert!(service.watch_presence(&watcher, "k", "news/sports", true).unwrap());
        service
            .subscribe(&conn, "k", "news/sports", SubscribeOptions::default())
            .unwrap();
        service.unsubscribe(&conn, "k", "news/sports").unwrap();

        let join: serde_json::Value =
            serde_json::from_slice(&watcher_rx.try_recv().unwrap().payload).unwrap();
        assert_eq!(join["event"], "subscribe");
        assert_eq!(join["channel"], "news/sports");
        assert_eq!(join["who"][0]["id"], "conn-1");

        let leave: serde_json::Value =
            serde_json::from_slice(&watcher_rx.try_recv().unwrap().payload).unwrap();
        assert_eq!(leave["event"], "unsubscribe");

        // Following presence does not put the watcher on the roster.
        assert!(service
            .presence_status("k", "news/sports", 0)
            .unwrap()
            .who
            .is_empty());
    }

    #[test]
    fn test_delivery_failures_are_isolated() {
        let service = service();
        let (slow, _slow_rx) = LocalSubscriber::new("slow", None, 1);
        let slow: SharedSubscriber = slow;
        let (gone, gone_rx) = connection("gone");
        let (ok, mut ok_rx) = connection("ok");
        let opts = SubscribeOptions::default();

        service.subscribe(&slow, "k", "a/b", opts).unwrap();
        service.subscribe(&gone, "k", "a/+", opts).unwrap();
        service.subscribe(&ok, "k", "a/#", opts).unwrap();
        drop(gone_rx);

        // Fill the slow subscriber's single slot.
        service.publish("k", "a/b", b"1".to_vec(), None).unwrap();
        let report = service.publish("k", "a/b", b"2".to_vec(), None).unwrap();

        assert_eq!(report.matched, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(&ok_rx.try_recv().unwrap().payload[..], b"1");
        assert_eq!(&ok_rx.try_recv().unwrap().payload[..], b"2");

        // The closed subscriber was removed during the first publish.
        assert_eq!(service.subscription_count(gone.id()), 0);
        assert!(!service.trie().lookup(&Ssid::encode(1, "a/b").unwrap()).contains(gone.id()));
    }

    #[test]
    fn test_disconnect_raises_unsubscribe() {
        let service = service();
        let (watcher, mut watcher_rx) = connection("watcher");
        let (conn, _rx) = connection("conn-1");
        let opts = SubscribeOptions::default();

        service.watch_presence(&watcher, "k", "a", true).unwrap();
        service.subscribe(&conn, "k", "a", opts).unwrap();
        service.subscribe(&conn, "k", "b/+", opts).unwrap();
        service.watch_presence(&conn, "k", "b", true).unwrap();
        let _join = watcher_rx.try_recv().unwrap();

        assert_eq!(service.disconnect(&*conn), 3);
        assert_eq!(service.subscription_count(conn.id()), 0);

        let leave: serde_json::Value =
            serde_json::from_slice(&watcher_rx.try_recv().unwrap().payload).unwrap();
        assert_eq!(leave["event"], "unsubscribe");
        assert_eq!(leave["who"][0]["id"], "conn-1");
        assert_eq!(service.trie().count(), 1);
    }

    fn payload(rx: &mut mpsc::Receiver<Arc<Message>>) -> serde_json::Value {
        serde_json::from_slice(&rx.try_recv().unwrap().payload).unwrap()
    }

    #[test]
    fn test_wildcard_subscription_presence_reaches_pattern_watchers() {
        let service = service();
        let (watcher, mut watcher_rx) = connection("watcher");
        let (concrete, mut concrete_rx) = connection("concrete");
        let (conn, _rx) = connection("conn-1");

        service.watch_presence(&watcher, "k", "news/+", true).unwrap();
        service.watch_presence(&concrete, "k", "news/sports", true).unwrap();
        service
            .subscribe(&conn, "k", "news/+", SubscribeOptions::default())
            .unwrap();
        service.unsubscribe(&conn, "k", "news/+").unwrap();

        let join = payload(&mut watcher_rx);
        assert_eq!(join["event"], "subscribe");
        assert_eq!(join["channel"], "news/+");
        assert_eq!(join["who"][0]["id"], "conn-1");
        assert_eq!(payload(&mut watcher_rx)["event"], "unsubscribe");

        // The pattern's feed is not the feed of a channel it matches.
        assert!(concrete_rx.try_recv().is_err());
    }

    /// Holds every subscribe notification for a while.
    struct SlowNotifier(Duration);

    impl Notifier for SlowNotifier {
        fn notify_subscribe(&self, _: &dyn Subscriber, _: &SubscriptionEvent) {
            std::thread::sleep(self.0);
        }

        fn notify_unsubscribe(&self, _: &dyn Subscriber, _: &SubscriptionEvent) {}
    }

    #[test]
    fn test_racing_subscribe_and_unsubscribe_keep_roster_consistent() {
        let trie = Arc::new(Trie::new());
        let service = Service::new(
            Arc::new(AllowAll::default()),
            Arc::new(NoopStorage),
            Arc::new(SlowNotifier(Duration::from_millis(50))),
            trie.clone(),
            Vec::new(),
        );
        let (watcher, mut watcher_rx) = connection("watcher");
        let (conn, _rx) = connection("conn-1");
        let room = Ssid::encode(1, "room").unwrap();
        service.watch_presence(&watcher, "k", "room", true).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                service
                    .subscribe(&conn, "k", "room", SubscribeOptions::default())
                    .unwrap();
            });
            scope.spawn(|| {
                while !trie.lookup(&room).contains(conn.id()) {
                    std::thread::yield_now();
                }
                assert!(service.unsubscribe(&conn, "k", "room").unwrap());
            });
        });

        assert!(!trie.lookup(&room).contains(conn.id()));
        assert_eq!(service.subscription_count(conn.id()), 0);
        assert_eq!(service.presence().count(&room), 0);
        assert_eq!(payload(&mut watcher_rx)["event"], "subscribe");
        assert_eq!(payload(&mut watcher_rx)["event"], "unsubscribe");
    }

    #[test]
    fn test_concurrent_subscribes_respect_limit() {
        let service = Service::with_config(
            Arc::new(AllowAll::default()),
            Arc::new(NoopStorage),
            Arc::new(NoopNotifier),
            Arc::new(Trie::new()),
            Vec::new(),
            ServiceConfig {
                max_subscriptions_per_connection: 5,
                presence: true,
            },
        );
        let (conn, _rx) = connection("conn-1");

        std::thread::scope(|scope| {
            for t in 0..8 {
                let service = &service;
                let conn = &conn;
                scope.spawn(move || {
                    for i in 0..10 {
                        let channel = format!("room/{}/{}", t, i);
                        let _ = service.subscribe(conn, "k", &channel, SubscribeOptions::default());
                    }
                });
            }
        });

        assert_eq!(service.subscription_count(conn.id()), 5);
        assert_eq!(service.trie().count(), 5);
        assert_eq!(service.presence().channel_count(), 5);
    }

    #[test]
    fn test_closed_watcher_removed_after_presence_fanout() {
        let service = service();
        let (gone, gone_rx) = connection("gone");
        let (watcher, mut watcher_rx) = connection("watcher");
        let (conn, _rx) = connection("conn-1");
        let opts = SubscribeOptions::default();

        service.watch_presence(&gone, "k", "room", true).unwrap();
        service.watch_presence(&watcher, "k", "room", true).unwrap();
        service.subscribe(&gone, "k", "room", opts).unwrap();
        assert_eq!(payload(&mut watcher_rx)["who"][0]["id"], "gone");
        drop(gone_rx);

        service.subscribe(&conn, "k", "room", opts).unwrap();

        // The join is delivered in full before the closed watcher leaves.
        let join = payload(&mut watcher_rx);
        assert_eq!(join["event"], "subscribe");
        assert_eq!(join["who"][0]["id"], "conn-1");
        let leave = payload(&mut watcher_rx);
        assert_eq!(leave["event"], "unsubscribe");
        assert_eq!(leave["who"][0]["id"], "gone");

        let presence = Ssid::presence(1, &Channel::parse("room").unwrap());
        assert!(!service.trie().lookup(&presence).contains(gone.id()));
        assert_eq!(service.subscription_count(gone.id()), 0);
        let roster = service.presence_status("k", "room", 0).unwrap().who;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].id, "conn-1");
    }

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        fn kind(&self) -> u32 {
            0x42
        }

        async fn handle(&self, _: &Service, request: Request) -> Result<Bytes, ServiceError> {
            Ok(request.payload)
        }
    }

    #[tokio::test]
    async fn test_handler_dispatch() {
        let service = Service::new(
            Arc::new(AllowAll::default()),
            Arc::new(NoopStorage),
            Arc::new(NoopNotifier),
            Arc::new(Trie::new()),
            vec![Arc::new(Echo)],
        );
        let (conn, _rx) = connection("conn-1");
        let request = |payload: &'static [u8]| Request {
            id: 1,
            subscriber: conn.clone(),
            payload: Bytes::from_static(payload),
        };

        let echoed = service.handle(0x42, request(b"ping")).await.unwrap();
        assert_eq!(&echoed[..], b"ping");

        let err = service.handle(0x99, request(b"")).await.unwrap_err();
        assert!(matches!(err, ServiceError::UnknownRequestType(0x99)));
        assert_eq!(err.code(), 404);

        // The service keeps serving after an unknown request.
        assert!(service.handle(0x42, request(b"again")).await.is_ok());
    }

    #[tokio::test]
    async fn test_presence_handler() {
        let service = service();
        let (conn, mut rx) = connection("conn-1");
        service
            .subscribe(&conn, "k", "news", SubscribeOptions::default())
            .unwrap();

        let request = Request {
            id: 3,
            subscriber: conn.clone(),
            payload: Bytes::from_static(
                br#"{"key":"k","channel":"news","status":true,"changes":true}"#,
            ),
        };
        let response = service
            .handle(crate::handler::REQUEST_PRESENCE, request)
            .await
            .unwrap();
        let status: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(status["req"], 3);
        assert_eq!(status["event"], "status");
        assert_eq!(status["who"][0]["id"], "conn-1");

        // Following changes: a new member is announced to conn-1.
        let (other, _other_rx) = connection("conn-2");
        service
            .subscribe(&other, "k", "news", SubscribeOptions::default())
            .unwrap();
        let join: serde_json::Value =
            serde_json::from_slice(&rx.try_recv().unwrap().payload).unwrap();
        assert_eq!(join["who"][0]["id"], "conn-2");

        let bad = Request {
            id: 4,
            subscriber: conn,
            payload: Bytes::from_static(b"not json"),
        };
        assert!(matches!(
            service.handle(crate::handler::REQUEST_PRESENCE, bad).await,
            Err(ServiceError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_retained_messages_replayed() {
        let service = Service::new(
            Arc::new(AllowAll::default()),
            Arc::new(MemoryStorage::default()),
            Arc::new(NoopNotifier),
            Arc::new(Trie::new()),
            Vec::new(),
        );
        service
            .publish("k", "news/sports", b"goal".to_vec(), Some(Duration::from_secs(60)))
            .unwrap();
        // Storage is fire-and-forget; give the spawned task a chance to run.
        tokio::task::yield_now().await;

        let (conn, mut rx) = connection("conn-1");
        service
            .subscribe(
                &conn,
                "k",
                "news/+",
                SubscribeOptions {
                    last: 10,
                    ..SubscribeOptions::default()
                },
            )
            .unwrap();

        let replayed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&replayed.payload[..], b"goal");
    }
}
