//! JSON envelope protocol spoken over every relay connection.
//!
//! Wire format (one UTF-8 text frame per envelope):
//! ```text
//! {"type":"chat",   "payload":{"id":..,"user":..,"text":..,"modality":..,"timestamp":..}}
//! {"type":"system", "payload":{ arbitrary server metadata }}
//! ```
//!
//! Decoding distinguishes three outcomes:
//! - `Ok(Some(envelope))` for a recognised kind,
//! - `Ok(None)` for a JSON object whose `type` is missing or unknown,
//! - `Err(CodecError)` for anything that is not a well-formed envelope.
//!
//! Receivers drop the last two without closing the connection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;
use uuid::Uuid;

/// Maximum length of room identifiers and user names, in characters.
pub const MAX_NAME_CHARS: usize = 24;

/// Room used when a connection does not name one.
pub const DEFAULT_ROOM: &str = "public";

/// User name used when a connection does not supply one.
pub const DEFAULT_USER: &str = "Guest";

/// Truncate to [`MAX_NAME_CHARS`] characters, falling back when absent or empty.
fn clamp_name(raw: Option<&str>, fallback: &str) -> String {
    match raw {
        Some(value) if !value.is_empty() => value.chars().take(MAX_NAME_CHARS).collect(),
        _ => fallback.to_owned(),
    }
}

/// Opaque room identifier. Two rooms are the same iff their ids are equal strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Resolve a raw connection parameter into an effective room id.
    pub fn resolve(raw: Option<&str>) -> Self {
        Self(clamp_name(raw, DEFAULT_ROOM))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Display name attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserName(String);

impl UserName {
    /// Resolve a raw connection parameter into an effective user name.
    pub fn resolve(raw: Option<&str>) -> Self {
        Self(clamp_name(raw, DEFAULT_USER))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a chat message was produced by its author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// Typed text
    Text,
    /// Speech-to-text dictation
    Speech,
    /// Recognised hand gesture
    Sign,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Speech => "speech",
            Self::Sign => "sign",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown modality '{0}' (expected text, speech or sign)")]
pub struct UnknownModality(pub String);

impl FromStr for Modality {
    type Err = UnknownModality;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "speech" => Ok(Self::Speech),
            "sign" => Ok(Self::Sign),
            other => Err(UnknownModality(other.to_owned())),
        }
    }
}

/// A chat message as authored by a client.
///
/// The relay never rewrites these. Fields it does not know about are kept in
/// `extra` and written back out unchanged, and `timestamp` keeps the exact
/// JSON number the author sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub user: String,
    pub text: String,
    pub modality: Modality,
    /// Milliseconds since the Unix epoch, as stamped by the author
    pub timestamp: Number,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    /// Author a new message with a fresh id and the current wall-clock time.
    pub fn new(user: impl Into<String>, text: impl Into<String>, modality: Modality) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user: user.into(),
            text: text.into(),
            modality,
            timestamp: Number::from(chrono::Utc::now().timestamp_millis()),
            extra: Map::new(),
        }
    }
}

/// Tagged message wrapper exchanged over a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Envelope {
    Chat(ChatMessage),
    System(Value),
}

impl Envelope {
    /// Server acknowledgement sent to a connection right after it joins.
    pub fn hello(room: &RoomId, user: &UserName) -> Self {
        Self::System(serde_json::json!({
            "hello": true,
            "room": room.as_str(),
            "user": user.as_str(),
        }))
    }

    /// Serialize to the JSON text carried in a frame.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::Serialization)
    }

    /// Parse a text frame.
    ///
    /// Returns `Ok(None)` when the frame is a JSON object whose `type` is
    /// absent or not a recognised kind.
    pub fn decode(frame: &str) -> Result<Option<Self>, CodecError> {
        let value: Value = serde_json::from_str(frame).map_err(CodecError::Malformed)?;
        let Value::Object(mut object) = value else {
            return Err(CodecError::NotAnObject);
        };

        let kind = object.get("type").and_then(Value::as_str).map(str::to_owned);
        let payload = object.remove("payload").unwrap_or(Value::Null);

        match kind.as_deref() {
            Some("chat") => {
                let message = serde_json::from_value(payload).map_err(CodecError::InvalidPayload)?;
                Ok(Some(Self::Chat(message)))
            }
            Some("system") => Ok(Some(Self::System(payload))),
            _ => Ok(None),
        }
    }

    /// Kind tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat(_) => "chat",
            Self::System(_) => "system",
        }
    }
}

/// Envelope decode/encode failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("invalid chat payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),
    #[error("failed to encode envelope: {0}")]
    Serialization(#[source] serde_json::Error),
}
