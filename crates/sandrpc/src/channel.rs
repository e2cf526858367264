//! # Channel
//!
//! An addressable publish/subscribe mailbox scoped to one capability domain.
//!
//! ## Philosophy
//!
//! - **Synchronous**: subscribe, publish and broadcast never suspend and never fail.
//!   Publishing to an event nobody listens to is a silent no-op.
//! - **Identity, not position**: every subscriber carries an id. Unsubscribing removes
//!   that id and nothing else, so handles taken later stay valid.
//! - **Snapshot dispatch**: the subscriber list is copied under the lock and the
//!   callbacks run without it. A callback may subscribe, publish or re-arm itself.
//!
//! A channel that belongs to a linked [`ChannelRegistry`](crate::registry::ChannelRegistry)
//! also forwards every local publish to the other side of the context boundary.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::envelope::Envelope;
use crate::registry::RegistryInner;

/// Opaque identifier of a logical capability domain (`api`, `frame`, ...).
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ChannelKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Callback invoked with the payload of a published event.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubscriberKind {
    /// Stays registered until explicitly unsubscribed.
    Persistent,
    /// Removed as soon as it fires.
    OneShot,
}

struct Subscriber {
    id: u64,
    kind: SubscriberKind,
    callback: Callback,
}

pub(crate) struct ChannelInner {
    key: ChannelKey,
    events: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    registry: Mutex<Weak<RegistryInner>>,
}

/// A named publish/subscribe mailbox. Cloning yields another handle to the same mailbox.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Channel {
    /// Creates a standalone channel. It becomes linked once registered.
    pub fn new(key: impl Into<ChannelKey>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                key: key.into(),
                events: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                registry: Mutex::new(Weak::new()),
            }),
        }
    }

    pub fn key(&self) -> &ChannelKey {
        &self.inner.key
    }

    /// Appends a persistent subscriber for `event`.
    pub fn subscribe<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let event = event.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        if !self.is_closed() {
            lock(&self.inner.events)
                .entry(event.clone())
                .or_default()
                .push(Subscriber {
                    id,
                    kind: SubscriberKind::Persistent,
                    callback: Arc::new(callback),
                });
        }

        Subscription {
            channel: Arc::downgrade(&self.inner),
            event,
            id,
        }
    }

    /// Replaces every subscriber of `event` with a single one-shot callback.
    ///
    /// On a closed channel the callback is dropped without ever running. The
    /// returned handle withdraws the one-shot if it has not fired yet.
    pub fn subscribe_once<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let event = event.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        if !self.is_closed() {
            let subscriber = Subscriber {
                id,
                kind: SubscriberKind::OneShot,
                callback: Arc::new(callback),
            };
            // the replaced list is dropped after the guard is released
            let _stale = lock(&self.inner.events).insert(event.clone(), vec![subscriber]);
        }

        Subscription {
            channel: Arc::downgrade(&self.inner),
            event,
            id,
        }
    }

    /// Invokes every subscriber of `event`, then forwards it across the boundary
    /// when the channel is linked.
    pub fn publish(&self, event: &str, payload: Value) {
        if self.is_closed() {
            return;
        }

        self.dispatch(event, &payload);
        self.forward(event, payload);
    }

    /// Invokes local subscribers only. Used for envelopes arriving from the other side.
    pub fn deliver(&self, event: &str, payload: &Value) {
        if self.is_closed() {
            return;
        }

        self.dispatch(event, payload);
    }

    /// Publishes `event` on every channel of the owning registry.
    ///
    /// The registry's channel list is captured before the first callback runs, so a
    /// channel registered by a handler does not receive this broadcast.
    pub fn broadcast(&self, event: &str, payload: Value) {
        let registry = lock(&self.inner.registry).upgrade();
        match registry {
            Some(registry) => registry.broadcast(event, payload),
            None => self.publish(event, payload),
        }
    }

    /// Drops every subscriber and detaches the channel from its registry.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        *lock(&self.inner.registry) = Weak::new();
        let _dropped = std::mem::take(&mut *lock(&self.inner.events));
    }

    /// Drops every subscriber of every event whose name starts with `prefix`.
    /// Returns how many events were cleared.
    pub fn unsubscribe_prefix(&self, prefix: &str) -> usize {
        let dropped: Vec<Vec<Subscriber>> = {
            let mut events = lock(&self.inner.events);
            let names: Vec<String> = events
                .keys()
                .filter(|event| event.starts_with(prefix))
                .cloned()
                .collect();
            names.iter().filter_map(|name| events.remove(name)).collect()
        };
        dropped.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        lock(&self.inner.events).get(event).map_or(0, Vec::len)
    }

    pub(crate) fn attach(&self, registry: Weak<RegistryInner>) {
        *lock(&self.inner.registry) = registry;
    }

    pub(crate) fn same_as(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn dispatch(&self, event: &str, payload: &Value) {
        let callbacks: Vec<Callback> = {
            let mut events = lock(&self.inner.events);
            let Some(subscribers) = events.get_mut(event) else {
                return;
            };

            let callbacks = subscribers.iter().map(|s| s.callback.clone()).collect();
            subscribers.retain(|s| s.kind == SubscriberKind::Persistent);
            if subscribers.is_empty() {
                events.remove(event);
            }
            callbacks
        };

        tracing::debug!(channel = %self.inner.key, event, subscribers = callbacks.len(), "dispatch");
        for callback in callbacks {
            callback(payload);
        }
    }

    fn forward(&self, event: &str, payload: Value) {
        let registry = lock(&self.inner.registry).upgrade();
        let Some(registry) = registry else { return };

        let envelope = Envelope {
            channel: self.inner.key.clone(),
            event: event.to_string(),
            payload,
        };
        registry.forward(envelope);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("key", &self.inner.key)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle to one subscription, persistent or one-shot.
#[derive(Debug)]
pub struct Subscription {
    channel: Weak<ChannelInner>,
    event: String,
    id: u64,
}

impl Subscription {
    /// Removes exactly this subscriber. Other subscribers keep their order.
    pub fn unsubscribe(self) {
        let Some(channel) = self.channel.upgrade() else { return };

        let removed = {
            let mut events = lock(&channel.events);
            let Some(subscribers) = events.get_mut(&self.event) else { return };

            let position = subscribers.iter().position(|s| s.id == self.id);
            let removed = position.map(|index| subscribers.remove(index));
            if subscribers.is_empty() {
                events.remove(&self.event);
            }
            removed
        };
        drop(removed);
    }

    pub fn event(&self) -> &str {
        &self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |name: &'static str| -> Callback {
            let log = log_clone.clone();
            Arc::new(move |_payload: &Value| log.lock().unwrap().push(name.to_string()))
        };
        (log, make)
    }

    #[test]
    fn test_subscribe_once_replaces_previous_one_shot() {
        let channel = Channel::new("api");
        let (log, make) = recorder();

        let first = make("first");
        let second = make("second");
        channel.subscribe_once("reply", move |p| first(p));
        channel.subscribe_once("reply", move |p| second(p));

        assert_eq!(channel.subscriber_count("reply"), 1);
        channel.publish("reply", json!(null));
        assert_eq!(*log.lock().unwrap(), vec!["second"]);
    }

    #[test]
    fn test_one_shot_fires_once() {
        let channel = Channel::new("api");
        let (log, make) = recorder();

        let once = make("once");
        channel.subscribe_once("reply", move |p| once(p));
        channel.publish("reply", json!(1));
        channel.publish("reply", json!(2));

        assert_eq!(*log.lock().unwrap(), vec!["once"]);
        assert_eq!(channel.subscriber_count("reply"), 0);
    }

    #[test]
    fn test_publish_order_follows_registration() {
        let channel = Channel::new("frame");
        let (log, make) = recorder();

        for name in ["c1", "c2", "c3"] {
            let callback = make(name);
            channel.subscribe("render", move |p| callback(p));
        }
        channel.publish("render", json!({"body": "x"}));

        assert_eq!(*log.lock().unwrap(), vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let channel = Channel::new("frame");
        channel.publish("nobody-listens", json!({"a": 1}));
        assert_eq!(channel.subscriber_count("nobody-listens"), 0);
    }

    #[test]
    fn test_unsubscribe_by_identity() {
        let channel = Channel::new("event");
        let (log, make) = recorder();

        let c1 = make("c1");
        let c2 = make("c2");
        let c3 = make("c3");
        let _s1 = channel.subscribe("click", move |p| c1(p));
        let s2 = channel.subscribe("click", move |p| c2(p));
        let _s3 = channel.subscribe("click", move |p| c3(p));

        s2.unsubscribe();
        channel.publish("click", json!(null));

        assert_eq!(*log.lock().unwrap(), vec!["c1", "c3"]);
    }

    #[test]
    fn test_callback_can_rearm_itself() {
        let channel = Channel::new("event");
        let hits = Arc::new(AtomicU64::new(0));

        fn arm(channel: Channel, hits: Arc<AtomicU64>) {
            let again = channel.clone();
            channel.subscribe_once("tick", move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
                arm(again.clone(), hits.clone());
            });
        }

        arm(channel.clone(), hits.clone());
        channel.publish("tick", json!(null));
        channel.publish("tick", json!(null));

        assert_eq!(hits.load(Ordering::Relaxed), 2);
        assert_eq!(channel.subscriber_count("tick"), 1);
    }

    #[test]
    fn test_unsubscribe_prefix_leaves_other_events() {
        let channel = Channel::new("api");
        let (log, make) = recorder();

        let reply = make("reply");
        let invoke = make("invoke");
        channel.subscribe_once("invoke-result:1", move |p| reply(p));
        channel.subscribe_once("invoke-result:2", |_| {});
        channel.subscribe("invoke", move |p| invoke(p));

        assert_eq!(channel.unsubscribe_prefix("invoke-result:"), 2);
        channel.publish("invoke-result:1", json!(null));
        channel.publish("invoke", json!(null));

        assert_eq!(*log.lock().unwrap(), vec!["invoke"]);
    }

    #[test]
    fn test_withdrawn_one_shot_never_fires() {
        let channel = Channel::new("api");
        let (log, make) = recorder();

        let once = make("once");
        let handle = channel.subscribe_once("reply", move |p| once(p));
        handle.unsubscribe();
        channel.publish("reply", json!(null));

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(channel.subscriber_count("reply"), 0);
    }

    #[test]
    fn test_stale_one_shot_handle_keeps_replacement() {
        let channel = Channel::new("api");
        let (log, make) = recorder();

        let first = make("first");
        let second = make("second");
        let stale = channel.subscribe_once("reply", move |p| first(p));
        let _live = channel.subscribe_once("reply", move |p| second(p));
        stale.unsubscribe();
        channel.publish("reply", json!(null));

        assert_eq!(*log.lock().unwrap(), vec!["second"]);
    }

    #[test]
    fn test_closed_channel_drops_subscriptions() {
        let channel = Channel::new("api");
        let (log, make) = recorder();

        let before = make("before");
        channel.subscribe("x", move |p| before(p));
        channel.close();

        let after = make("after");
        channel.subscribe_once("x", move |p| after(p));
        channel.publish("x", json!(null));

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(channel.subscriber_count("x"), 0);
    }
}
