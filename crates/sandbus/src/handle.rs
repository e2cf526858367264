use std::sync::Arc;

use sandrpc::Channel;
use sandrpc::ChannelKey;
use sandrpc::ChannelRegistry;
use sandrpc::DuplexTransport;
use sandrpc::Link;
use sandrun::EVENT_KEY;
use sandrun::FrameId;
use sandrun::Interaction;
use sandrun::IsolatedExecutionHost;
use sandrun::LoadState;
use sandrun::Runtime;
use sandrun::interaction_event;

use crate::bus::ContextId;
use crate::bus::Error;
use crate::bus::Result;
use crate::extension::Extension;

/// One isolated context as seen from the host.
///
/// Holds the isolated host and the host-side registry. Both registries are
/// joined by a duplex transport, so every channel key exists twice: once as
/// the manager's channel inside, once as the handle extensions attach to.
pub struct ContextHandle {
    id: ContextId,
    host: IsolatedExecutionHost,
    registry: ChannelRegistry,
    _link: Link,
}

impl ContextHandle {
    pub(crate) fn spawn(id: ContextId, runtime: Runtime, extensions: &[Arc<dyn Extension>]) -> Self {
        let (inner, outer) = DuplexTransport::pair();
        let host = IsolatedExecutionHost::spawn(runtime, Arc::new(inner));

        let registry = ChannelRegistry::new();
        for extension in extensions {
            let channel = registry.get_or_create(extension.channel_key());
            extension.attach(id, &channel);
        }
        registry.get_or_create(EVENT_KEY);

        let link = Link::spawn(id.to_string(), Arc::new(outer), registry.clone());
        Self {
            id,
            host,
            registry,
            _link: link,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn host(&self) -> &IsolatedExecutionHost {
        &self.host
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Host-side handle of the channel with `key`.
    pub fn channel(&self, key: impl Into<ChannelKey>) -> Option<Channel> {
        self.registry.get(&key.into())
    }

    pub fn state(&self) -> LoadState {
        self.host.state()
    }

    pub async fn load(&self, source: impl AsRef<[u8]>) -> Result<()> {
        self.host.load(source).await?;
        Ok(())
    }

    /// Sends a user interaction to the frame's event handler inside the context.
    pub fn dispatch_interaction(&self, frame_id: &FrameId, interaction: &Interaction) -> Result<()> {
        let payload = serde_json::to_value(interaction).map_err(Error::Encode)?;
        let channel = self
            .channel(EVENT_KEY)
            .ok_or_else(|| Error::Closed(self.id))?;
        channel.publish(&interaction_event(frame_id), payload);
        Ok(())
    }

    /// Closes every host-side channel. Pending deliveries to this context are dropped.
    pub(crate) fn close(&self) {
        for key in self.registry.keys() {
            if let Some(channel) = self.registry.remove(&key) {
                channel.close();
            }
        }
        self.registry.unlink();
    }
}
