//! Event manager: routes user interactions back to registered callbacks.
//!
//! `handle_event` arms a one-shot subscription on `event-{frameId}`. Each
//! delivery runs every registration matching the interaction's element id and
//! event name, then arms the subscription again, so exactly one handler is
//! ever live per frame.

use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use sandrpc::Channel;
use sandrpc::Manager;
use sandrpc::MemberError;
use sandrpc::RESET_EVENT;
use sandrpc::lock;

use super::FrameId;
use super::string_arg;
use crate::guest::GuestQueue;

/// Channel key of the event manager.
pub const EVENT_KEY: &str = "event";

/// Name of the event carrying interactions for `frame_id`.
pub fn interaction_event(frame_id: &FrameId) -> String {
    format!("event-{}", frame_id)
}

/// A user interaction reported by the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub element_id: String,
    pub event_name: String,
    #[serde(default)]
    pub detail: Value,
}

pub type EventCallback = Arc<dyn Fn(&Interaction) + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredEvent {
    pub element_id: String,
    pub event_name: String,
    pub callback: EventCallback,
}

type Table = Arc<Mutex<Vec<RegisteredEvent>>>;

pub struct EventManager {
    channel: Channel,
    registered: Table,
    guest: Option<GuestQueue>,
}

impl EventManager {
    /// `guest` receives the calls produced by guest-side registrations.
    pub fn new(channel: Channel, guest: Option<GuestQueue>) -> Self {
        let registered: Table = Arc::new(Mutex::new(Vec::new()));

        let table = registered.clone();
        let _reset = channel.subscribe(RESET_EVENT, move |_| lock(&table).clear());

        Self {
            channel,
            registered,
            guest,
        }
    }

    pub fn register(
        &self,
        element_id: impl Into<String>,
        event_name: impl Into<String>,
        callback: EventCallback,
    ) {
        lock(&self.registered).push(RegisteredEvent {
            element_id: element_id.into(),
            event_name: event_name.into(),
            callback,
        });
    }

    /// Arms the interaction handler for `frame_id`, replacing any handler
    /// armed before.
    pub fn handle_event(&self, frame_id: &FrameId) {
        arm(self.channel.clone(), frame_id.clone(), self.registered.clone());
    }

    pub fn registered_count(&self) -> usize {
        lock(&self.registered).len()
    }
}

fn arm(channel: Channel, frame_id: FrameId, table: Table) {
    let event = interaction_event(&frame_id);
    let next = channel.clone();
    channel.subscribe_once(event, move |payload| {
        match serde_json::from_value::<Interaction>(payload.clone()) {
            Ok(interaction) => fire(&table, &interaction),
            Err(e) => tracing::warn!(frame = %frame_id, error = %e, "malformed interaction"),
        }
        arm(next.clone(), frame_id.clone(), table.clone());
    });
}

fn fire(table: &Table, interaction: &Interaction) {
    let matching: Vec<EventCallback> = lock(table)
        .iter()
        .filter(|r| r.element_id == interaction.element_id && r.event_name == interaction.event_name)
        .map(|r| r.callback.clone())
        .collect();

    tracing::debug!(
        element = %interaction.element_id,
        event = %interaction.event_name,
        handlers = matching.len(),
        "interaction"
    );

    for callback in matching {
        callback(interaction);
    }
}

impl Manager for EventManager {
    fn channel(&self) -> &Channel {
        &self.channel
    }

    fn actions(&self) -> &[&'static str] {
        &[]
    }

    fn has_member(&self, name: &str) -> bool {
        matches!(name, "register" | "handleEvent")
    }

    fn call_member(&self, name: &str, args: Vec<Value>) -> Result<Value, MemberError> {
        match name {
            "register" => {
                let element_id = string_arg(&args, 0, "elementId")?;
                let event_name = string_arg(&args, 1, "eventName")?;
                let export = string_arg(&args, 2, "export")?;
                let guest = self
                    .guest
                    .as_ref()
                    .ok_or_else(|| MemberError::Failed("no guest attached".into()))?;
                self.register(element_id, event_name, guest.callback(export));
                Ok(Value::Null)
            }
            "handleEvent" => {
                let frame_id = FrameId::new(string_arg(&args, 0, "frameId")?);
                self.handle_event(&frame_id);
                Ok(Value::Null)
            }
            _ => Err(MemberError::NotFound(name.to_string())),
        }
    }
}
