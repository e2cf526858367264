//! # sandbus
//!
//! The host side of the boundary. A [`MessageBus`] owns any number of
//! isolated contexts and serves their managers through extensions: the API
//! extension answers declared actions through an [`ApiResolver`], the frame
//! extension publishes what guests render.
//!
//! ## Philosophy
//!
//! The host never trusts a context. Undecodable input is logged and dropped.
//! Resolver failures are answered with an error marker. Releasing a context
//! drops every channel it could still reach.

pub mod api;
pub mod bus;
pub mod extension;
pub mod frame;
pub mod handle;
pub mod report;
pub mod source;

pub use api::ApiExtension;
pub use api::ApiRequest;
pub use api::ApiResolver;
pub use api::ResolveError;
pub use api::Unrouted;
pub use bus::ContextId;
pub use bus::Error;
pub use bus::MessageBus;
pub use bus::MessageBusBuilder;
pub use bus::Result;
pub use extension::Extension;
pub use frame::FrameExtension;
pub use frame::FrameHub;
pub use frame::FrameSubscription;
pub use frame::RenderedFrame;
pub use handle::ContextHandle;
pub use report::ReportId;
pub use report::report_error;
pub use source::FileSourceStore;
pub use source::MemorySourceStore;
pub use source::SourceStore;
