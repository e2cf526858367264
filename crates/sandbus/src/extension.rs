use sandrpc::Channel;
use sandrpc::ChannelKey;

use crate::bus::ContextId;

/// A host-side collaborator serving one manager's channel.
///
/// `attach` runs once per context, on the host-side handle of the channel
/// named by `channel_key`, before the context is linked.
pub trait Extension: Send + Sync + 'static {
    fn channel_key(&self) -> ChannelKey;

    fn attach(&self, context: ContextId, channel: &Channel);
}
