//! # Injector
//!
//! The capability surface handed to a guest on load. Managers are looked up
//! by name and come back wrapped in an [`ActionDispatcher`], so declared
//! actions are forwarded to the host and everything else is answered by the
//! manager itself.
//!
//! ## Guest ABI
//!
//! Guests import three functions from the `sandbox` module. Strings and JSON
//! travel through the guest's exported `memory` as `(ptr, len)` pairs.
//!
//! - `get(injector, name_ptr, name_len) -> handle` returns `-1` for unknown names
//! - `call(handle, member_ptr, member_len, args_ptr, args_len, out_ptr, out_cap) -> len`
//!   takes a JSON array of arguments (empty means none) and writes the JSON
//!   result to `out`, returning its length or a negative [`status`] code
//! - `log(ptr, len)` forwards a line to the host's tracing output

use std::sync::Arc;

use serde_json::Value;
use wasmtime::Caller;
use wasmtime::Linker;
use wasmtime::Memory;

use sandrpc::ActionDispatcher;
use sandrpc::CallError;
use sandrpc::Channel;
use sandrpc::ChannelRegistry;
use sandrpc::InvokeError;
use sandrpc::Manager;

use crate::context::SandboxCtx;
use crate::guest::GuestQueue;
use crate::managers::API_MANAGER;
use crate::managers::ApiFacade;
use crate::managers::ApiManager;
use crate::managers::EVENT_MANAGER;
use crate::managers::EventManager;
use crate::managers::FRAME_MANAGER;
use crate::managers::FrameManager;
use crate::managers::api::API_KEY;
use crate::managers::event::EVENT_KEY;
use crate::managers::frame::FRAME_KEY;

/// Import module the guest ABI lives in.
pub const IMPORT_MODULE: &str = "sandbox";
/// Functions the guest may import from [`IMPORT_MODULE`].
pub const IMPORTS: &[&str] = &["get", "call", "log"];
/// Value passed to the guest's `main` as its injector.
pub const INJECTOR: i32 = 1;

/// Negative results of the guest `call` import.
pub mod status {
    /// Unknown handle or member.
    pub const UNDEFINED: i32 = -1;
    /// Remote failure, or a local member failed.
    pub const FAILED: i32 = -2;
    /// Abandoned by a reset, cancelled, or timed out.
    pub const ABANDONED: i32 = -3;
    /// The output buffer is too small for the result.
    pub const OVERFLOW: i32 = -4;
    /// Member name or arguments could not be decoded.
    pub const MALFORMED: i32 = -5;
}

#[derive(Clone)]
pub struct Injector {
    entries: Vec<(&'static str, ActionDispatcher<dyn Manager>)>,
    api: Arc<ApiManager>,
    frames: Arc<FrameManager>,
    events: Arc<EventManager>,
}

impl Injector {
    /// Creates fresh managers on fresh channels and registers them in
    /// `registry`, replacing and closing any channels of a previous install.
    pub fn install(registry: &ChannelRegistry, guest: Option<GuestQueue>) -> Self {
        let api = Arc::new(ApiManager::new(Channel::new(API_KEY)));
        let events = Arc::new(EventManager::new(Channel::new(EVENT_KEY), guest));
        let frames = Arc::new(FrameManager::new(Channel::new(FRAME_KEY), events.clone()));

        let injector = Self::from_managers(api, frames, events);
        for (_, dispatcher) in &injector.entries {
            if let Some(previous) = registry.register(dispatcher.manager().channel().clone()) {
                tracing::debug!(channel = %previous.key(), "replaced channel");
            }
        }
        injector
    }

    fn from_managers(
        api: Arc<ApiManager>,
        frames: Arc<FrameManager>,
        events: Arc<EventManager>,
    ) -> Self {
        let entries: Vec<(&'static str, ActionDispatcher<dyn Manager>)> = vec![
            (API_MANAGER, ActionDispatcher::new(api.clone() as Arc<dyn Manager>)),
            (FRAME_MANAGER, ActionDispatcher::new(frames.clone() as Arc<dyn Manager>)),
            (EVENT_MANAGER, ActionDispatcher::new(events.clone() as Arc<dyn Manager>)),
        ];
        Self {
            entries,
            api,
            frames,
            events,
        }
    }

    pub fn get(&self, name: &str) -> Option<ActionDispatcher<dyn Manager>> {
        self.index_of(name).and_then(|index| self.by_index(index))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(name, _)| *name).collect()
    }

    pub fn api(&self) -> ApiFacade {
        ApiFacade::new(self.api.clone())
    }

    pub fn frames(&self) -> &Arc<FrameManager> {
        &self.frames
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(entry, _)| *entry == name)
    }

    pub(crate) fn by_index(&self, index: usize) -> Option<ActionDispatcher<dyn Manager>> {
        self.entries.get(index).map(|(_, dispatcher)| dispatcher.clone())
    }
}

/// Defines the `sandbox` imports on `linker`.
pub(crate) fn link(linker: &mut Linker<SandboxCtx>) -> wasmtime::Result<()> {
    linker.func_wrap(
        IMPORT_MODULE,
        "get",
        |mut caller: Caller<'_, SandboxCtx>, injector: i32, ptr: i32, len: i32| -> wasmtime::Result<i32> {
            if injector != INJECTOR {
                return Ok(status::UNDEFINED);
            }
            let Ok(name) = String::from_utf8(read_bytes(&mut caller, ptr, len)?) else {
                return Ok(status::UNDEFINED);
            };
            let handle = caller
                .data()
                .injector()
                .index_of(&name)
                .and_then(|index| i32::try_from(index).ok());
            if handle.is_none() {
                tracing::debug!(%name, "guest asked for unknown manager");
            }
            Ok(handle.unwrap_or(status::UNDEFINED))
        },
    )?;

    linker.func_wrap_async(
        IMPORT_MODULE,
        "call",
        |mut caller: Caller<'_, SandboxCtx>,
         (handle, member_ptr, member_len, args_ptr, args_len, out_ptr, out_cap): (
            i32,
            i32,
            i32,
            i32,
            i32,
            i32,
            i32,
        )| {
            Box::new(async move {
                let Some(dispatcher) = caller.data().dispatcher(handle) else {
                    return Ok(status::UNDEFINED);
                };
                let Ok(member) = String::from_utf8(read_bytes(&mut caller, member_ptr, member_len)?) else {
                    return Ok(status::MALFORMED);
                };
                let Some(args) = parse_args(&read_bytes(&mut caller, args_ptr, args_len)?) else {
                    return Ok(status::MALFORMED);
                };

                let timeout = caller.data().call_timeout();
                let outcome = match tokio::time::timeout(timeout, dispatcher.call(&member, args)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(CallError::Invoke(InvokeError::Timeout)),
                };

                match outcome {
                    Ok(value) => write_value(&mut caller, &value, out_ptr, out_cap),
                    Err(e) => {
                        tracing::debug!(%member, error = %e, "guest call failed");
                        Ok(status_of(&e))
                    }
                }
            })
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "log",
        |mut caller: Caller<'_, SandboxCtx>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let bytes = read_bytes(&mut caller, ptr, len)?;
            tracing::info!(target: "sandbox::guest", "{}", String::from_utf8_lossy(&bytes));
            Ok(())
        },
    )?;

    Ok(())
}

fn status_of(error: &CallError) -> i32 {
    match error {
        CallError::Undefined(_) | CallError::Member(sandrpc::MemberError::NotFound(_)) => {
            status::UNDEFINED
        }
        CallError::Member(sandrpc::MemberError::InvalidArguments(_)) => status::MALFORMED,
        CallError::Member(sandrpc::MemberError::Failed(_)) => status::FAILED,
        CallError::Invoke(InvokeError::Remote(_) | InvokeError::Malformed(_)) => status::FAILED,
        CallError::Invoke(InvokeError::Abandoned | InvokeError::Cancelled | InvokeError::Timeout) => {
            status::ABANDONED
        }
    }
}

/// Empty input means no arguments; otherwise a JSON array is required.
fn parse_args(bytes: &[u8]) -> Option<Vec<Value>> {
    if bytes.is_empty() {
        return Some(Vec::new());
    }
    match serde_json::from_slice(bytes).ok()? {
        Value::Array(args) => Some(args),
        _ => None,
    }
}

fn memory(caller: &mut Caller<'_, SandboxCtx>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .ok_or_else(|| wasmtime::Error::msg("guest does not export `memory`"))
}

/// The `len` bytes at `ptr`, or `None` when the range leaves `data`.
fn guest_slice(data: &[u8], ptr: i32, len: i32) -> Option<&[u8]> {
    let ptr = usize::try_from(ptr).ok()?;
    let len = usize::try_from(len).ok()?;
    data.get(ptr..ptr.checked_add(len)?)
}

fn read_bytes(caller: &mut Caller<'_, SandboxCtx>, ptr: i32, len: i32) -> wasmtime::Result<Vec<u8>> {
    if ptr < 0 || len < 0 {
        return Err(wasmtime::Error::msg("negative guest pointer or length"));
    }
    if len == 0 {
        return Ok(Vec::new());
    }
    let memory = memory(caller)?;
    // bounds are checked before anything is copied out of guest memory
    guest_slice(memory.data(&*caller), ptr, len)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| wasmtime::Error::msg("guest range out of bounds"))
}

fn write_value(
    caller: &mut Caller<'_, SandboxCtx>,
    value: &Value,
    out_ptr: i32,
    out_cap: i32,
) -> wasmtime::Result<i32> {
    let bytes = serde_json::to_vec(value)?;
    let (Ok(ptr), Ok(cap)) = (usize::try_from(out_ptr), usize::try_from(out_cap)) else {
        return Ok(status::OVERFLOW);
    };
    if bytes.len() > cap {
        return Ok(status::OVERFLOW);
    }
    let Ok(written) = i32::try_from(bytes.len()) else {
        return Ok(status::OVERFLOW);
    };
    let memory = memory(caller)?;
    memory.write(&mut *caller, ptr, &bytes)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use sandrpc::ChannelKey;
    use sandrpc::MemberError;

    #[test]
    fn test_guest_slice_bounds() {
        let data = [1u8, 2, 3, 4];
        assert_eq!(guest_slice(&data, 1, 2), Some(&data[1..3]));
        assert_eq!(guest_slice(&data, 0, 4), Some(&data[..]));
        assert_eq!(guest_slice(&data, 4, 0), Some(&data[4..]));
        assert_eq!(guest_slice(&data, 2, 3), None);
        assert_eq!(guest_slice(&data, 0, i32::MAX), None);
        assert_eq!(guest_slice(&data, i32::MAX, i32::MAX), None);
        assert_eq!(guest_slice(&data, -1, 1), None);
    }

    #[test]
    fn test_lookup_by_name() {
        let registry = ChannelRegistry::new();
        let injector = Injector::install(&registry, None);

        assert_eq!(injector.names(), vec![API_MANAGER, FRAME_MANAGER, EVENT_MANAGER]);
        assert!(injector.get("ApiManager").is_some());
        assert!(injector.get("StorageManager").is_none());
        assert_eq!(injector.index_of("EventManager"), Some(2));
    }

    #[test]
    fn test_install_registers_and_replaces_channels() {
        let registry = ChannelRegistry::new();
        let first = Injector::install(&registry, None);
        assert_eq!(registry.len(), 3);

        let second = Injector::install(&registry, None);

        assert_eq!(registry.len(), 3);
        assert!(first.frames().channel().is_closed());
        assert!(!second.frames().channel().is_closed());
        let current = registry.get(&ChannelKey::new(FRAME_KEY)).unwrap();
        assert!(!current.is_closed());
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(parse_args(b""), Some(vec![]));
        assert_eq!(parse_args(br#"["a", 1]"#), Some(vec![json!("a"), json!(1)]));
        assert_eq!(parse_args(br#"{"a": 1}"#), None);
        assert_eq!(parse_args(b"nope"), None);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_of(&CallError::Undefined("x".into())), status::UNDEFINED);
        assert_eq!(
            status_of(&CallError::Member(MemberError::InvalidArguments("x".into()))),
            status::MALFORMED
        );
        assert_eq!(status_of(&CallError::Invoke(InvokeError::Timeout)), status::ABANDONED);
        assert_eq!(status_of(&CallError::Invoke(InvokeError::Abandoned)), status::ABANDONED);
    }
}
