//! Frame manager: creates frames and publishes their rendered bodies.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use sandrpc::Channel;
use sandrpc::Manager;
use sandrpc::MemberError;
use sandrpc::RESET_EVENT;

use super::EventManager;
use super::string_arg;

/// Channel key of the frame manager.
pub const FRAME_KEY: &str = "frame";
/// Event published on the frame channel for every render.
pub const RENDER_EVENT: &str = "render";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(String);

impl FrameId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("frame-{:016x}", rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload of the `render` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderPayload {
    pub frame_id: FrameId,
    pub title: String,
    pub body: Value,
}

/// A frame created through the manager.
#[derive(Clone)]
pub struct Frame {
    id: FrameId,
    title: String,
    channel: Channel,
    events: Arc<EventManager>,
}

impl Frame {
    pub fn id(&self) -> &FrameId {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn render(&self, body: impl Into<Value>) {
        let payload = RenderPayload {
            frame_id: self.id.clone(),
            title: self.title.clone(),
            body: body.into(),
        };
        match serde_json::to_value(&payload) {
            Ok(value) => self.channel.publish(RENDER_EVENT, value),
            Err(e) => tracing::warn!(frame = %self.id, error = %e, "unserializable render"),
        }
    }

    /// Starts listening for interactions addressed to this frame.
    pub fn enable_event_handler(&self) {
        self.events.handle_event(&self.id);
    }
}

pub struct FrameManager {
    channel: Channel,
    events: Arc<EventManager>,
    frames: Arc<DashMap<FrameId, String>>,
}

impl FrameManager {
    pub fn new(channel: Channel, events: Arc<EventManager>) -> Self {
        let frames: Arc<DashMap<FrameId, String>> = Arc::new(DashMap::new());

        let table = frames.clone();
        let _reset = channel.subscribe(RESET_EVENT, move |_| table.clear());

        Self {
            channel,
            events,
            frames,
        }
    }

    pub fn create(&self, title: impl Into<String>) -> Frame {
        let id = FrameId::generate();
        let title = title.into();
        self.frames.insert(id.clone(), title.clone());
        tracing::debug!(frame = %id, %title, "frame created");
        self.frame_unchecked(id, title)
    }

    pub fn frame(&self, id: &FrameId) -> Option<Frame> {
        let title = self.frames.get(id)?.value().clone();
        Some(self.frame_unchecked(id.clone(), title))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn frame_unchecked(&self, id: FrameId, title: String) -> Frame {
        Frame {
            id,
            title,
            channel: self.channel.clone(),
            events: self.events.clone(),
        }
    }

    fn lookup(&self, args: &[Value]) -> Result<Frame, MemberError> {
        let id = FrameId::new(string_arg(args, 0, "frameId")?);
        self.frame(&id)
            .ok_or_else(|| MemberError::Failed(format!("unknown frame '{}'", id)))
    }
}

impl Manager for FrameManager {
    fn channel(&self) -> &Channel {
        &self.channel
    }

    fn actions(&self) -> &[&'static str] {
        &[]
    }

    fn has_member(&self, name: &str) -> bool {
        matches!(name, "create" | "render" | "enableEventHandler")
    }

    fn call_member(&self, name: &str, args: Vec<Value>) -> Result<Value, MemberError> {
        match name {
            "create" => {
                let title = string_arg(&args, 0, "title")?;
                Ok(Value::from(self.create(title).id().as_str()))
            }
            "render" => {
                let frame = self.lookup(&args)?;
                let body = args.get(1).cloned().unwrap_or(Value::Null);
                frame.render(body);
                Ok(Value::Null)
            }
            "enableEventHandler" => {
                self.lookup(&args)?.enable_event_handler();
                Ok(Value::Null)
            }
            _ => Err(MemberError::NotFound(name.to_string())),
        }
    }
}
