//! WebSocket wire protocol
//!
//! One JSON object per frame: `{id, type, payload}`.
//!
//! Client to server: `auth`, `subscribe`, `unsubscribe`, `data`.
//! Server to client: `event`, `ack`, `error`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;
use vibe_core::{Result, VibeError};

/// Frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Auth,
    Subscribe,
    Unsubscribe,
    Data,
    Event,
    Ack,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Data => "data",
            Self::Event => "event",
            Self::Ack => "ack",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
        }
    }

    /// Parse an inbound frame
    pub fn parse(raw: &str) -> Result<Self> {
        let envelope: Self = serde_json::from_str(raw)
            .map_err(|e| VibeError::Protocol(format!("malformed frame: {}", e)))?;

        if envelope.id.is_empty() {
            return Err(VibeError::Protocol("frame id must not be empty".to_string()));
        }
        Ok(envelope)
    }

    /// `event` frame carrying any serializable payload
    pub fn event(payload: &impl Serialize) -> Result<Self> {
        Ok(Self::new(MessageType::Event, serde_json::to_value(payload)?))
    }

    /// `ack` for a request, echoing its id
    pub fn ack(request_id: &str, payload: Value) -> Self {
        Self {
            id: request_id.to_string(),
            kind: MessageType::Ack,
            payload,
        }
    }

    /// `error` reply; echoes the request id when one was parsed
    pub fn error(request_id: Option<&str>, message: impl Into<String>) -> Self {
        let id = request_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            id,
            kind: MessageType::Error,
            payload: json!({ "message": message.into() }),
        }
    }

    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Typed view of an inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Auth { token: String },
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
    Data(Value),
}

#[derive(Deserialize)]
struct AuthPayload {
    token: String,
}

/// `{"channels": [...]}` or the single-channel shorthand `{"channel": "..."}`
#[derive(Deserialize)]
struct ChannelsPayload {
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default)]
    channel: Option<String>,
}

impl ChannelsPayload {
    fn into_channels(self) -> Result<Vec<String>> {
        let mut channels = self.channels;
        channels.extend(self.channel);

        if channels.is_empty() {
            return Err(VibeError::Protocol("no channels given".to_string()));
        }
        if channels.iter().any(|c| c.trim().is_empty()) {
            return Err(VibeError::Protocol("channel names must not be empty".to_string()));
        }
        Ok(channels)
    }
}

impl Request {
    /// Interpret an envelope sent by a client.
    ///
    /// Server-to-client types are rejected here.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let payload = envelope.payload.clone();

        match envelope.kind {
            MessageType::Auth => {
                let auth: AuthPayload = serde_json::from_value(payload)
                    .map_err(|e| VibeError::Protocol(format!("invalid auth payload: {}", e)))?;
                Ok(Self::Auth { token: auth.token })
            }
            MessageType::Subscribe => Ok(Self::Subscribe {
                channels: channels_from(payload)?,
            }),
            MessageType::Unsubscribe => Ok(Self::Unsubscribe {
                channels: channels_from(payload)?,
            }),
            MessageType::Data => Ok(Self::Data(payload)),
            other => Err(VibeError::Protocol(format!(
                "message type '{}' cannot be sent by clients",
                other
            ))),
        }
    }
}

fn channels_from(payload: Value) -> Result<Vec<String>> {
    let parsed: ChannelsPayload = serde_json::from_value(payload)
        .map_err(|e| VibeError::Protocol(format!("invalid channel payload: {}", e)))?;
    parsed.into_channels()
}
