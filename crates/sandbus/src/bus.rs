//! # Message bus
//!
//! Host-side table of isolated contexts. Each context gets its own isolated
//! host, its own pair of linked registries, and the bus's extensions
//! attached to its host-side channels.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use sandrun::FrameId;
use sandrun::Interaction;
use sandrun::LoadError;
use sandrun::Runtime;

use crate::api::ApiExtension;
use crate::api::ApiResolver;
use crate::api::Unrouted;
use crate::extension::Extension;
use crate::frame::FrameExtension;
use crate::frame::FrameHub;
use crate::frame::FrameSubscription;
use crate::frame::RenderedFrame;
use crate::handle::ContextHandle;

/// Strong type for context identifiers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

#[derive(Debug)]
pub enum Error {
    Runtime(sandrun::runtime::Error),
    ContextNotFound(ContextId),
    /// The context was released while in use.
    Closed(ContextId),
    Load(LoadError),
    Encode(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runtime(e) => write!(f, "Runtime error: {}", e),
            Self::ContextNotFound(id) => write!(f, "Context not found: {}", id),
            Self::Closed(id) => write!(f, "Context closed: {}", id),
            Self::Load(e) => write!(f, "Load error: {}", e),
            Self::Encode(e) => write!(f, "Encode error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<sandrun::runtime::Error> for Error {
    fn from(e: sandrun::runtime::Error) -> Self {
        Self::Runtime(e)
    }
}

impl From<LoadError> for Error {
    fn from(e: LoadError) -> Self {
        Self::Load(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

const FRAME_STREAM_CAPACITY: usize = 256;

pub struct MessageBusBuilder {
    runtime: Option<Runtime>,
    resolver: Option<Arc<dyn ApiResolver>>,
    extensions: Vec<Arc<dyn Extension>>,
}

impl MessageBusBuilder {
    pub fn runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ApiResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Adds an extension attached to every context after the built-in ones.
    pub fn extension(mut self, extension: Arc<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn build(self) -> Result<MessageBus> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Runtime::new()?,
        };
        let resolver = self.resolver.unwrap_or_else(|| Arc::new(Unrouted));
        let frames = FrameHub::new(FRAME_STREAM_CAPACITY);

        let mut extensions: Vec<Arc<dyn Extension>> = vec![
            Arc::new(ApiExtension::new(resolver)),
            Arc::new(FrameExtension::new(frames.clone())),
        ];
        extensions.extend(self.extensions);

        Ok(MessageBus {
            runtime,
            extensions,
            frames,
            contexts: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }
}

pub struct MessageBus {
    runtime: Runtime,
    extensions: Vec<Arc<dyn Extension>>,
    frames: FrameHub,
    contexts: DashMap<ContextId, Arc<ContextHandle>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn builder() -> MessageBusBuilder {
        MessageBusBuilder {
            runtime: None,
            resolver: None,
            extensions: Vec::new(),
        }
    }

    /// Creates an empty context. Must be called from within a tokio runtime.
    pub fn create_context(&self) -> ContextId {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = ContextHandle::spawn(id, self.runtime.clone(), &self.extensions);
        self.contexts.insert(id, Arc::new(handle));
        tracing::info!(context = %id, "context created");
        id
    }

    pub fn context(&self, id: ContextId) -> Option<Arc<ContextHandle>> {
        self.contexts.get(&id).map(|entry| entry.value().clone())
    }

    pub fn context_ids(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self.contexts.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Tears a context down. Returns `false` for unknown ids.
    pub fn release(&self, id: ContextId) -> bool {
        let Some((_, handle)) = self.contexts.remove(&id) else {
            return false;
        };
        handle.close();
        self.frames.clear(id);
        tracing::info!(context = %id, "context released");
        true
    }

    pub fn release_all(&self) {
        for id in self.context_ids() {
            self.release(id);
        }
    }

    pub async fn load(&self, id: ContextId, source: impl AsRef<[u8]>) -> Result<()> {
        let handle = self.context(id).ok_or(Error::ContextNotFound(id))?;
        handle.load(source).await
    }

    pub fn dispatch_interaction(
        &self,
        id: ContextId,
        frame_id: &FrameId,
        interaction: &Interaction,
    ) -> Result<()> {
        let handle = self.context(id).ok_or(Error::ContextNotFound(id))?;
        handle.dispatch_interaction(frame_id, interaction)
    }

    pub fn on_frame_rendered<F>(&self, listener: F) -> FrameSubscription
    where
        F: Fn(&RenderedFrame) + Send + Sync + 'static,
    {
        self.frames.on_frame_rendered(listener)
    }

    /// Stream of every frame rendered by any context.
    pub fn frames(&self) -> broadcast::Receiver<RenderedFrame> {
        self.frames.subscribe()
    }

    /// Latest render of every frame of context `id`.
    pub fn rendered_frames(&self, id: ContextId) -> Vec<RenderedFrame> {
        self.frames.rendered(id)
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.release_all();
    }
}
