//! # Managers
//!
//! Stateful capability units living inside the isolated context. Each owns
//! exactly one channel and declares which of its names are remoted.
//!
//! A fresh set is installed on every load. Installing registers the new
//! channels, which replaces and closes the previous load's channels.

pub mod api;
pub mod event;
pub mod frame;

use serde_json::Value;

use sandrpc::MemberError;

pub use api::ApiAction;
pub use api::ApiFacade;
pub use api::ApiManager;
pub use event::EventCallback;
pub use event::EventManager;
pub use event::Interaction;
pub use event::RegisteredEvent;
pub use frame::Frame;
pub use frame::FrameId;
pub use frame::FrameManager;
pub use frame::RenderPayload;

/// Injector name of the API manager.
pub const API_MANAGER: &str = "ApiManager";
/// Injector name of the frame manager.
pub const FRAME_MANAGER: &str = "FrameManager";
/// Injector name of the event manager.
pub const EVENT_MANAGER: &str = "EventManager";

pub(crate) fn string_arg(args: &[Value], index: usize, name: &str) -> Result<String, MemberError> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(MemberError::InvalidArguments(format!(
            "argument {} ('{}') must be a string, got {}",
            index, name, other
        ))),
        None => Err(MemberError::InvalidArguments(format!(
            "missing argument {} ('{}')",
            index, name
        ))),
    }
}
