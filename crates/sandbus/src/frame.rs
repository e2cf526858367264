//! # Frame extension
//!
//! Turns `render` events into [`RenderedFrame`]s. Frames reach the
//! embedding application three ways: listeners registered with
//! [`FrameHub::on_frame_rendered`], a tokio broadcast stream, and a table of
//! the latest render of every frame per context.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use sandrpc::Channel;
use sandrpc::ChannelKey;
use sandrpc::RESET_EVENT;
use sandrpc::lock;
use sandrun::FRAME_KEY;
use sandrun::FrameId;
use sandrun::RENDER_EVENT;
use sandrun::RenderPayload;

use crate::bus::ContextId;
use crate::extension::Extension;

/// A frame as rendered by a guest.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RenderedFrame {
    pub context: ContextId,
    pub id: FrameId,
    pub title: String,
    pub content: Value,
}

type Listener = Arc<dyn Fn(&RenderedFrame) + Send + Sync>;

struct HubInner {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
    stream: broadcast::Sender<RenderedFrame>,
    latest: DashMap<ContextId, Vec<RenderedFrame>>,
}

#[derive(Clone)]
pub struct FrameHub {
    inner: Arc<HubInner>,
}

impl FrameHub {
    /// `capacity` bounds how far a [`FrameHub::subscribe`] receiver may lag.
    pub fn new(capacity: usize) -> Self {
        let (stream, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(HubInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                stream,
                latest: DashMap::new(),
            }),
        }
    }

    pub fn on_frame_rendered<F>(&self, listener: F) -> FrameSubscription
    where
        F: Fn(&RenderedFrame) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners).push((id, Arc::new(listener)));
        FrameSubscription {
            hub: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RenderedFrame> {
        self.inner.stream.subscribe()
    }

    pub fn emit(&self, frame: RenderedFrame) {
        {
            let mut latest = self.inner.latest.entry(frame.context).or_default();
            match latest.iter_mut().find(|f| f.id == frame.id) {
                Some(existing) => *existing = frame.clone(),
                None => latest.push(frame.clone()),
            }
        }

        let listeners: Vec<Listener> = lock(&self.inner.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(&frame);
        }

        // no receivers is fine
        let _ = self.inner.stream.send(frame);
    }

    /// Latest render of every frame of `context`, in order of first render.
    pub fn rendered(&self, context: ContextId) -> Vec<RenderedFrame> {
        self.inner
            .latest
            .get(&context)
            .map(|frames| frames.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self, context: ContextId) {
        self.inner.latest.remove(&context);
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }
}

/// Handle to one frame listener.
pub struct FrameSubscription {
    hub: Weak<HubInner>,
    id: u64,
}

impl FrameSubscription {
    pub fn unsubscribe(self) {
        let Some(hub) = self.hub.upgrade() else { return };
        let removed = {
            let mut listeners = lock(&hub.listeners);
            listeners
                .iter()
                .position(|(id, _)| *id == self.id)
                .map(|index| listeners.remove(index))
        };
        drop(removed);
    }
}

pub struct FrameExtension {
    hub: FrameHub,
}

impl FrameExtension {
    pub fn new(hub: FrameHub) -> Self {
        Self { hub }
    }
}

impl Extension for FrameExtension {
    fn channel_key(&self) -> ChannelKey {
        ChannelKey::new(FRAME_KEY)
    }

    fn attach(&self, context: ContextId, channel: &Channel) {
        let hub = self.hub.clone();
        let _render = channel.subscribe(RENDER_EVENT, move |payload| {
            match serde_json::from_value::<RenderPayload>(payload.clone()) {
                Ok(render) => {
                    tracing::debug!(%context, frame = %render.frame_id, "frame rendered");
                    hub.emit(RenderedFrame {
                        context,
                        id: render.frame_id,
                        title: render.title,
                        content: render.body,
                    });
                }
                Err(e) => tracing::warn!(%context, error = %e, "undecodable render"),
            }
        });

        let hub = self.hub.clone();
        let _reset = channel.subscribe(RESET_EVENT, move |_| hub.clear(context));
    }
}
