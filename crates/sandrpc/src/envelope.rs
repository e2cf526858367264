//! # Wire Envelope
//!
//! Everything crossing the context boundary is an [`Envelope`]: a channel key,
//! an event name and an immutable JSON payload. Envelopes are encoded as JSON
//! bytes so any byte [`Transport`](crate::transport::Transport) can carry them.
//!
//! Remote calls use two payload shapes on top of it:
//! - `invoke` carries an [`Invoke`] with a process-unique correlation id;
//! - the reply is published on `invoke-result:{id}` and carries an [`InvokeReply`].

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::channel::ChannelKey;

/// Event carrying a remote call request.
pub const INVOKE_EVENT: &str = "invoke";

/// Context-wide lifecycle signal broadcast before a reload.
pub const RESET_EVENT: &str = "reset";

/// Common prefix of every reply event name.
pub const REPLY_PREFIX: &str = "invoke-result:";

/// Name of the event on which the reply to call `id` is published.
pub fn reply_event(id: u64) -> String {
    format!("{}{}", REPLY_PREFIX, id)
}

#[derive(Debug)]
pub enum Error {
    Encode(serde_json::Error),
    Decode(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Envelope encode error: {}", e),
            Self::Decode(e) => write!(f, "Envelope decode error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: ChannelKey,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::Decode)
    }
}

/// Payload of an `invoke` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invoke {
    pub id: u64,
    pub action: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

/// Failure reported by the side that ran a remote action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Correlation identifier of the logged diagnostic.
    pub report: String,
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (report {})", self.message, self.report)
    }
}

/// Payload of an `invoke-result:{id}` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvokeReply {
    pub id: u64,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl InvokeReply {
    pub fn ok(id: u64, value: Value) -> Self {
        Self { id, value, error: None }
    }

    pub fn err(id: u64, error: RemoteError) -> Self {
        Self { id, value: Value::Null, error: Some(error) }
    }

    pub fn into_result(self) -> std::result::Result<Value, RemoteError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope {
            channel: ChannelKey::from("api"),
            event: INVOKE_EVENT.into(),
            payload: json!({"id": 7, "action": "get", "arguments": ["http://x"]}),
        };

        let bytes = envelope.encode().unwrap();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["channel"], "api");
        assert_eq!(raw["event"], "invoke");
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Envelope::decode(b"\xff\x00"), Err(Error::Decode(_))));
    }

    #[test]
    fn test_reply_with_null_value_is_ok() {
        let reply: InvokeReply = serde_json::from_value(json!({"id": 3, "value": null})).unwrap();
        assert_eq!(reply.into_result().unwrap(), Value::Null);

        let failed: InvokeReply = serde_json::from_value(json!({
            "id": 4,
            "error": {"report": "abc", "message": "boom"}
        }))
        .unwrap();
        assert_eq!(failed.into_result().unwrap_err().message, "boom");
        assert_eq!(reply_event(4), "invoke-result:4");
    }
}
