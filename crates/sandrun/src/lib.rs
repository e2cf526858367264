//! # sandrun
//!
//! The isolated side of the boundary: a WebAssembly guest runs inside a
//! fuel- and memory-bounded store and reaches the outside world only through
//! the managers handed to it by the [`Injector`].
//!
//! ## Philosophy
//!
//! Guests get no ambient authority. Every capability is a manager on a named
//! channel, and every declared action becomes a message the host may answer
//! or refuse. Reloading a guest throws away all of its managers, channels and
//! pending calls.

pub mod context;
pub mod guest;
pub mod host;
pub mod injector;
pub mod managers;
pub mod runtime;

pub use context::SandboxCtx;
pub use guest::GuestCall;
pub use guest::GuestQueue;
pub use host::DENIED_IMPORT_MODULES;
pub use host::ENTRY_POINT;
pub use host::IsolatedExecutionHost;
pub use host::LoadError;
pub use host::LoadState;
pub use injector::Injector;
pub use injector::status;
pub use managers::ApiAction;
pub use managers::ApiFacade;
pub use managers::ApiManager;
pub use managers::EventCallback;
pub use managers::EventManager;
pub use managers::Frame;
pub use managers::FrameId;
pub use managers::FrameManager;
pub use managers::Interaction;
pub use managers::RegisteredEvent;
pub use managers::RenderPayload;
pub use managers::api::API_KEY;
pub use managers::api::UnknownAction;
pub use managers::event::EVENT_KEY;
pub use managers::event::interaction_event;
pub use managers::frame::FRAME_KEY;
pub use managers::frame::RENDER_EVENT;
pub use runtime::Budget;
pub use runtime::Runtime;
pub use runtime::SandboxConfig;
