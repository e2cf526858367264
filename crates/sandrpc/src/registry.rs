//! # Channel Registry
//!
//! Per-context table mapping a [`ChannelKey`] to its live [`Channel`].
//!
//! Uses DashMap so the pump task delivering inbound envelopes and the code
//! registering managers never contend on a global lock.

use std::sync::Arc;
use std::sync::Mutex;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::channel::Channel;
use crate::channel::ChannelKey;
use crate::channel::lock;
use crate::envelope::Envelope;

/// Sink receiving every envelope published by a linked channel.
pub type Outbound = mpsc::UnboundedSender<Envelope>;

pub(crate) struct RegistryInner {
    channels: DashMap<ChannelKey, Channel>,
    outbound: Mutex<Option<Outbound>>,
}

impl RegistryInner {
    pub(crate) fn broadcast(&self, event: &str, payload: Value) {
        let snapshot: Vec<Channel> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        tracing::debug!(event, channels = snapshot.len(), "broadcast");
        for channel in snapshot {
            channel.publish(event, payload.clone());
        }
    }

    pub(crate) fn forward(&self, envelope: Envelope) {
        let outbound = lock(&self.outbound).clone();
        let Some(outbound) = outbound else { return };

        if outbound.send(envelope).is_err() {
            tracing::debug!("outbound link closed, envelope dropped");
        }
    }
}

/// Clonable handle to the channel table of one execution context.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                channels: DashMap::new(),
                outbound: Mutex::new(None),
            }),
        }
    }

    /// Installs `channel` under its key.
    ///
    /// A channel previously registered under the same key is replaced, closed and
    /// returned; its subscribers are never merged into the new one.
    pub fn register(&self, channel: Channel) -> Option<Channel> {
        channel.attach(Arc::downgrade(&self.inner));
        let previous = self.inner.channels.insert(channel.key().clone(), channel.clone());

        match previous {
            Some(previous) if !previous.same_as(&channel) => {
                tracing::debug!(channel = %channel.key(), "channel replaced");
                previous.close();
                Some(previous)
            }
            _ => None,
        }
    }

    pub fn get(&self, key: &ChannelKey) -> Option<Channel> {
        self.inner.channels.get(key).map(|entry| entry.value().clone())
    }

    /// Returns the channel for `key`, registering a fresh one if needed.
    pub fn get_or_create(&self, key: impl Into<ChannelKey>) -> Channel {
        let key = key.into();
        let entry = self.inner.channels.entry(key.clone()).or_insert_with(|| {
            let channel = Channel::new(key);
            channel.attach(Arc::downgrade(&self.inner));
            channel
        });
        entry.value().clone()
    }

    pub fn remove(&self, key: &ChannelKey) -> Option<Channel> {
        let (_, channel) = self.inner.channels.remove(key)?;
        channel.close();
        Some(channel)
    }

    /// Registered keys in sorted order.
    pub fn keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<ChannelKey> = self
            .inner
            .channels
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.channels.is_empty()
    }

    /// Publishes `event` on every registered channel (snapshot taken first).
    pub fn broadcast(&self, event: &str, payload: Value) {
        self.inner.broadcast(event, payload);
    }

    /// Routes every local publish of every channel, current or future, to `outbound`.
    pub fn link(&self, outbound: Outbound) {
        *lock(&self.inner.outbound) = Some(outbound);
    }

    pub fn unlink(&self) {
        *lock(&self.inner.outbound) = None;
    }

    /// Hands an envelope from the other side to its channel.
    ///
    /// An unknown channel key is not an error: nobody is listening yet.
    pub fn deliver(&self, envelope: &Envelope) {
        match self.get(&envelope.channel) {
            Some(channel) => channel.deliver(&envelope.event, &envelope.payload),
            None => {
                tracing::debug!(channel = %envelope.channel, event = %envelope.event, "no such channel, dropped");
            }
        }
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
