//! # sandrpc
//!
//! Cross-context invocation layer: named channels that multiplex remote calls and
//! event notifications between a host and an isolated execution context.
//!
//! ## Core Concepts
//!
//! - **Channel**: a publish/subscribe mailbox for one capability domain
//! - **ChannelRegistry**: the per-context table of channels, with broadcast
//! - **Envelope**: the JSON wire shape `{channel, event, payload}`
//! - **Link**: pumps envelopes between a registry and a Transport
//! - **ActionDispatcher**: turns a declared action name into an invoke/reply round trip
//!
//! Both sides of a boundary hold their own registry. A publish on a linked channel
//! runs local subscribers and is forwarded; an inbound envelope is delivered to local
//! subscribers only.

pub mod channel;
pub mod dispatch;
pub mod envelope;
pub mod link;
pub mod registry;
pub mod transport;

pub use channel::Callback;
pub use channel::Channel;
pub use channel::ChannelKey;
pub use channel::SubscriberKind;
pub use channel::Subscription;
pub use channel::lock;
pub use dispatch::ActionDispatcher;
pub use dispatch::CallError;
pub use dispatch::CancelHandle;
pub use dispatch::InvokeError;
pub use dispatch::Manager;
pub use dispatch::Member;
pub use dispatch::MemberError;
pub use dispatch::PendingCall;
pub use dispatch::RemoteAction;
pub use envelope::Envelope;
pub use envelope::INVOKE_EVENT;
pub use envelope::Invoke;
pub use envelope::InvokeReply;
pub use envelope::REPLY_PREFIX;
pub use envelope::RESET_EVENT;
pub use envelope::RemoteError;
pub use envelope::reply_event;
pub use link::Link;
pub use registry::ChannelRegistry;
pub use transport::DuplexTransport;
pub use transport::Transport;
